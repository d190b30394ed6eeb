//! Result formatting.

use std::time::Duration;

use infer_core::{ItemInfo, ScoredItem};
use tokio::task::JoinSet;

/// Round a score to four decimal digits.
pub fn round_score(score: f32) -> f64 {
    (f64::from(score) * 10_000.0).round() / 10_000.0
}

/// Project candidates to result rows, one task per row.
///
/// Rows not projected within `timeout` are dropped. The rest keep the input
/// order.
pub async fn format_items(items: Vec<ItemInfo>, timeout: Duration) -> Vec<ScoredItem> {
    let deadline = tokio::time::Instant::now() + timeout;
    let total = items.len();
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        tasks.spawn(async move {
            (
                index,
                ScoredItem {
                    itemid: item.item_id,
                    score: round_score(item.score),
                },
            )
        });
    }

    let mut rows = Vec::with_capacity(total);
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(row))) => rows.push(row),
            Ok(Some(Err(e))) => tracing::error!(error = %e, "format task failed"),
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(formatted = rows.len(), total, "format deadline reached");
                break;
            }
        }
    }
    tasks.abort_all();

    rows.sort_by_key(|(index, _)| *index);
    rows.into_iter().map(|(_, row)| row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_score() {
        assert_eq!(round_score(0.123_456), 0.1235);
        assert_eq!(round_score(1.0), 1.0);
        assert_eq!(round_score(-0.000_04), -0.0);
    }

    #[tokio::test]
    async fn test_format_keeps_order_and_rounds() {
        let items = vec![
            ItemInfo::new("i1", 0.987_654),
            ItemInfo::new("i2", 0.1),
            ItemInfo::new("i3", 0.333_333),
        ];

        let rows = format_items(items, Duration::from_millis(100)).await;

        let ids: Vec<&str> = rows.iter().map(|r| r.itemid.as_str()).collect();
        assert_eq!(ids, vec!["i1", "i2", "i3"]);
        assert_eq!(rows[0].score, 0.9877);
        assert_eq!(rows[2].score, 0.3333);
    }

    #[tokio::test]
    async fn test_format_empty() {
        assert!(format_items(Vec::new(), Duration::from_millis(100)).await.is_empty());
    }
}
