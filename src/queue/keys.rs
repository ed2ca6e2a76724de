//! Store key layout for one queue-name.
//!
//! | Key                   | Type       | Content                                  |
//! |-----------------------|------------|------------------------------------------|
//! | `{q}`                 | list       | pending envelopes, head runs next        |
//! | `{q}:claimed`         | list       | popped envelopes not yet indexed         |
//! | `{q}:processing`      | hash       | `task_id` -> in-flight record            |
//! | `{q}:delayed`         | sorted set | retry envelopes scored by due time (ms)  |
//! | `{q}:dead_letter`     | list       | dead-letter entries                      |
//! | `{q}:status:{job_id}` | hash       | Status Record fields, with TTL           |
//! | `{q}:stats`           | hash       | lifetime counters                        |
//! | `{q}:probe`           | string     | write probe used by `connect()`          |

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub pending: String,
    pub claimed: String,
    pub processing: String,
    pub delayed: String,
    pub dead_letter: String,
    pub stats: String,
    pub probe: String,
    status_prefix: String,
}

impl QueueKeys {
    pub fn new(queue_name: &str) -> Self {
        Self {
            pending: queue_name.to_string(),
            claimed: format!("{}:claimed", queue_name),
            processing: format!("{}:processing", queue_name),
            delayed: format!("{}:delayed", queue_name),
            dead_letter: format!("{}:dead_letter", queue_name),
            stats: format!("{}:stats", queue_name),
            probe: format!("{}:probe", queue_name),
            status_prefix: format!("{}:status:", queue_name),
        }
    }

    pub fn status(&self, job_id: &str) -> String {
        format!("{}{}", self.status_prefix, job_id)
    }

    pub fn status_prefix(&self) -> &str {
        &self.status_prefix
    }

    /// Recovers the job id from a status key.
    pub fn job_id_of<'a>(&self, status_key: &'a str) -> Option<&'a str> {
        status_key.strip_prefix(self.status_prefix.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("translation_jobs");
        assert_eq!(keys.pending, "translation_jobs");
        assert_eq!(keys.processing, "translation_jobs:processing");
        assert_eq!(keys.dead_letter, "translation_jobs:dead_letter");
        assert_eq!(keys.status("j1"), "translation_jobs:status:j1");
        assert_eq!(keys.job_id_of("translation_jobs:status:j1"), Some("j1"));
        assert_eq!(keys.job_id_of("other:status:j1"), None);
    }
}
