//! Greedy non-max suppression.

use crate::boxes::BBox;

/// Returns the indices of the kept boxes, highest score first.
///
/// A box is dropped when its IoU with an already kept box exceeds
/// `threshold`. At most `max_output` indices are returned.
pub fn non_max_suppression(
    boxes: &[BBox],
    scores: &[f32],
    threshold: f32,
    max_output: usize,
) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());

    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep: Vec<usize> = Vec::new();
    for index in order {
        if keep.len() >= max_output {
            break;
        }
        let candidate = &boxes[index];
        if keep
            .iter()
            .all(|&kept| boxes[kept].iou(candidate) <= threshold)
        {
            keep.push(index);
        }
    }
    keep
}

/// Indices of the `k` highest scores, highest first.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    if k < order.len() {
        order.select_nth_unstable_by(k, |&a, &b| scores[b].total_cmp(&scores[a]));
        order.truncate(k);
    }
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_overlapping_lower_scores() {
        let boxes = [
            BBox::new(0.0, 0.0, 10.0, 10.0),
            BBox::new(0.0, 1.0, 10.0, 11.0),
            BBox::new(20.0, 20.0, 30.0, 30.0),
        ];
        let scores = [0.8, 0.9, 0.3];

        let keep = non_max_suppression(&boxes, &scores, 0.5, 10);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn respects_max_output() {
        let boxes = [
            BBox::new(0.0, 0.0, 1.0, 1.0),
            BBox::new(5.0, 5.0, 6.0, 6.0),
            BBox::new(9.0, 9.0, 10.0, 10.0),
        ];
        let keep = non_max_suppression(&boxes, &[0.1, 0.2, 0.3], 0.7, 2);
        assert_eq!(keep, vec![2, 1]);
    }

    #[test]
    fn top_k_orders_by_score() {
        assert_eq!(top_k(&[0.2, 0.9, 0.5, 0.7], 2), vec![1, 3]);
        assert_eq!(top_k(&[0.2, 0.9], 5), vec![1, 0]);
    }
}
