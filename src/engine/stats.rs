use chrono::{DateTime, Utc};

/// 一次调用结束后产出的统计更新请求（每次尝试恰好一条）
#[derive(Debug, Clone)]
pub struct StatsUpdate {
    pub api_index: usize,
    pub success: bool,
    pub next_call_time: DateTime<Utc>,
}

/// 交给存储层执行的纯增量操作，绝不整行覆盖
#[derive(Debug, Clone)]
pub struct StatsDelta {
    pub api_index: usize,
    pub total_inc: i64,
    pub success_inc: i64,
    pub failed_inc: i64,
    pub last_call: DateTime<Utc>,
    pub next_call: DateTime<Utc>,
}

/// 把一批更新请求折算成计数器增量：成功 -> success+total，
/// 失败 -> failed+total；last_call 统一取当前时刻
pub fn aggregate(updates: &[StatsUpdate], now: DateTime<Utc>) -> Vec<StatsDelta> {
    updates
        .iter()
        .map(|u| StatsDelta {
            api_index: u.api_index,
            total_inc: 1,
            success_inc: if u.success { 1 } else { 0 },
            failed_inc: if u.success { 0 } else { 1 },
            last_call: now,
            next_call: u.next_call_time,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn success_and_failure_map_to_the_right_counters() {
        let now = Utc::now();
        let next = now + Duration::seconds(60);
        let updates = vec![
            StatsUpdate { api_index: 3, success: true, next_call_time: next },
            StatsUpdate { api_index: 3, success: false, next_call_time: next },
        ];

        let deltas = aggregate(&updates, now);
        assert_eq!(deltas.len(), 2);

        // 两条增量依次生效后：total +2、success +1、failed +1
        let total: i64 = deltas.iter().map(|d| d.total_inc).sum();
        let success: i64 = deltas.iter().map(|d| d.success_inc).sum();
        let failed: i64 = deltas.iter().map(|d| d.failed_inc).sum();
        assert_eq!((total, success, failed), (2, 1, 1));

        for d in &deltas {
            assert_eq!(d.api_index, 3);
            assert_eq!(d.last_call, now);
            assert_eq!(d.next_call, next);
        }
    }

    #[test]
    fn empty_input_produces_no_deltas() {
        assert!(aggregate(&[], Utc::now()).is_empty());
    }
}
