//! 工单自动分派

use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::InterventionKind;

/// 分派策略
pub trait Assigner: Send + Sync {
    fn pick(&self, organization_id: &str, kind: InterventionKind) -> Option<String>;
}

/// 按组织轮询；组织未配置成员时用 "default"
#[derive(Debug, Default)]
pub struct RoundRobinAssigner {
    team: HashMap<String, Vec<String>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinAssigner {
    pub fn new(team: HashMap<String, Vec<String>>) -> Self {
        Self {
            team,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn members(&self, organization_id: &str) -> Option<(&str, &[String])> {
        [organization_id, "default"].into_iter().find_map(|key| {
            self.team
                .get_key_value(key)
                .filter(|(_, m)| !m.is_empty())
                .map(|(k, m)| (k.as_str(), m.as_slice()))
        })
    }
}

impl Assigner for RoundRobinAssigner {
    fn pick(&self, organization_id: &str, _kind: InterventionKind) -> Option<String> {
        let (key, members) = self.members(organization_id)?;
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(key.to_string()).or_insert(0);
        let member = members[*cursor % members.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(member)
    }
}
