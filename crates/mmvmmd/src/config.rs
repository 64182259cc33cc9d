use std::path::PathBuf;

/// Daemon configuration resolved from the environment variables named in
/// spec.md §6, with the spec's defaults. A small hand-rolled struct in the
/// teacher's own style (`DaemonState::new` reads `std::env` directly rather
/// than going through a config-crate layered loader).
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_dir: PathBuf,
    pub qemu_path: String,
    pub ip_path: String,
    pub database_uri: String,
}

impl Config {
    pub fn from_env() -> Self {
        let socket_dir = std::env::var("SOCKET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/run/mmvmm"));

        let qemu_path =
            std::env::var("QEMU_PATH").unwrap_or_else(|_| "qemu-system-x86_64".to_string());

        let ip_path = std::env::var("IP_PATH").unwrap_or_else(|_| "ip".to_string());

        let database_uri = std::env::var("DATABASE_URI")
            .unwrap_or_else(|_| "sqlite:///var/lib/mmvmm/mmvmm.db".to_string());

        Self {
            socket_dir,
            qemu_path,
            ip_path,
            database_uri,
        }
    }

    /// Path to the control RPC socket (spec.md §6: `$SOCKET_DIR/control.sock`).
    pub fn control_socket_path(&self) -> PathBuf {
        self.socket_dir.join("control.sock")
    }

    /// Strips the `sqlite://` scheme prefix so the path can be handed to
    /// `rusqlite::Connection::open`.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(
            self.database_uri
                .strip_prefix("sqlite://")
                .unwrap_or(&self.database_uri),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_strips_scheme() {
        let cfg = Config {
            socket_dir: PathBuf::from("/run/mmvmm"),
            qemu_path: "qemu-system-x86_64".into(),
            ip_path: "ip".into(),
            database_uri: "sqlite:///var/lib/mmvmm/mmvmm.db".into(),
        };
        assert_eq!(cfg.database_path(), PathBuf::from("/var/lib/mmvmm/mmvmm.db"));
    }

    #[test]
    fn control_socket_is_under_socket_dir() {
        let cfg = Config {
            socket_dir: PathBuf::from("/run/mmvmm"),
            qemu_path: "qemu-system-x86_64".into(),
            ip_path: "ip".into(),
            database_uri: "sqlite://:memory:".into(),
        };
        assert_eq!(cfg.control_socket_path(), PathBuf::from("/run/mmvmm/control.sock"));
    }
}
