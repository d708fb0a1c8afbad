use crate::config::ScoringConfig;
use crate::embed::Embedding;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompareError {
    #[error("Embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Euclidean distance between two embeddings of equal length
pub fn euclidean_distance(a: &Embedding, b: &Embedding) -> Result<f32, CompareError> {
    if a.len() != b.len() {
        return Err(CompareError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let sum: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Ok(sum.sqrt())
}

/// Map a distance to an integer similarity in [0, 100].
///
/// Non-increasing in `distance`, 100 at zero. NaN lands on the floor.
pub fn similarity(distance: f32, policy: &ScoringConfig) -> u8 {
    let near_sim = policy.near_similarity.min(100) as f32;
    let floor = (policy.floor_similarity as f32).min(near_sim);

    let score = if distance.is_nan() || distance >= policy.far_distance {
        floor
    } else if distance <= 0.0 {
        100.0
    } else if distance <= policy.near_distance {
        100.0 - (distance / policy.near_distance) * (100.0 - near_sim)
    } else {
        let span = policy.far_distance - policy.near_distance;
        near_sim - ((distance - policy.near_distance) / span) * (near_sim - floor)
    };

    score.round().clamp(0.0, 100.0) as u8
}

/// Candidate indices ordered by ascending distance; ties keep input order
pub fn rank_by_distance(distances: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..distances.len()).collect();
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));
    order
}
