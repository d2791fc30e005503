pub const TOPIC_CMD_POWER: &str = "cmnd/power";
pub const TOPIC_CMD_SCHEDULE: &str = "cmnd/schedule";
pub const TOPIC_STATE: &str = "state";

/// Joins a configured prefix with one of the topic suffixes above.
pub fn topic(prefix: &str, suffix: &str) -> String {
    format!("{}/{suffix}", prefix.trim_end_matches('/'))
}
