#[derive(Debug, Clone)]
pub struct Bird {
    pub daemon_path: String,
}

impl Default for Bird {
    fn default() -> Self {
        Self {
            daemon_path: String::from("/usr/sbin/bird"),
        }
    }
}
