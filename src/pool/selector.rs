//! 选择策略：在已通过可用性过滤的候选集中挑选一个凭证。
//!
//! 两种策略共享同一套优先级分组规则：按 tokenData.priority 取最大分组，
//! 组内按 id 升序排序（确定性平局打破）。

use std::collections::HashMap;

/// 游标回绕点（防溢出）。
const CURSOR_WRAP: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectStrategy {
    /// 优先级 + 轮询：同组内按游标轮转。
    #[default]
    RoundRobin,
    /// 优先级 + 填充优先：始终选同组内第一个，直到其不可用。
    FillFirst,
}

impl SelectStrategy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "fill-first" | "fill_first" | "fillfirst" => Self::FillFirst,
            _ => Self::RoundRobin,
        }
    }
}

/// 候选凭证的选择视图。
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub priority: i64,
}

#[derive(Debug)]
pub struct Selector {
    strategy: SelectStrategy,
    /// 轮询游标，按 `provider:model` 维护。
    cursors: HashMap<String, u32>,
}

impl Selector {
    pub fn new(strategy: SelectStrategy) -> Self {
        Self {
            strategy,
            cursors: HashMap::new(),
        }
    }

    /// 从候选集中选择一个凭证 id；候选为空时返回 None。
    pub fn pick(&mut self, provider: &str, model: &str, candidates: &[Candidate]) -> Option<String> {
        let bucket = top_priority_bucket(candidates);
        if bucket.is_empty() {
            return None;
        }

        match self.strategy {
            SelectStrategy::FillFirst => Some(bucket[0].clone()),
            SelectStrategy::RoundRobin => {
                let key = format!("{provider}:{model}");
                let cursor = self.cursors.entry(key).or_insert(0);
                let idx = (*cursor as usize) % bucket.len();
                *cursor += 1;
                if *cursor >= CURSOR_WRAP {
                    *cursor = 0;
                }
                Some(bucket[idx].clone())
            }
        }
    }

    #[cfg(test)]
    fn set_cursor(&mut self, provider: &str, model: &str, value: u32) {
        self.cursors.insert(format!("{provider}:{model}"), value);
    }
}

/// 取最高优先级分组，组内按 id 升序。
fn top_priority_bucket(candidates: &[Candidate]) -> Vec<String> {
    let Some(max_priority) = candidates.iter().map(|c| c.priority).max() else {
        return Vec::new();
    };

    let mut bucket: Vec<String> = candidates
        .iter()
        .filter(|c| c.priority == max_priority)
        .map(|c| c.id.clone())
        .collect();
    bucket.sort();
    bucket
}
