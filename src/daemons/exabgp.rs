#[derive(Debug, Clone)]
pub struct ExaBgp {
    pub daemon_path: String,
}

impl Default for ExaBgp {
    fn default() -> Self {
        Self {
            daemon_path: String::from("/usr/bin/exabgp"),
        }
    }
}
