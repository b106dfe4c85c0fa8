use common::config::MysqlConfig;
use mysql_async::{Opts, OptsBuilder};

/// Settings used to connect to MySQL. The tool runs on the database host,
/// so a unix socket is preferred when configured.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Unix socket path; wins over host/port when set.
    pub socket: Option<String>,

    /// Hostname to connect. Defaults to "127.0.0.1".
    pub host: String,

    /// Port number to connect. Defaults to 3306.
    pub port: u16,

    pub username: String,

    pub password: String,

    /// 目标库
    pub database: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> SessionOptions {
        SessionOptions {
            socket: None,
            host: String::from("127.0.0.1"),
            port: 3306,
            username: String::from("root"),
            password: String::new(),
            database: None,
        }
    }
}

impl SessionOptions {
    pub fn new(host: String, port: u16, username: String, password: String) -> SessionOptions {
        SessionOptions {
            socket: None,
            host,
            port,
            username,
            password,
            database: None,
        }
    }

    pub fn from_config(config: &MysqlConfig) -> SessionOptions {
        SessionOptions {
            socket: config.socket.clone(),
            host: config.get_host().to_string(),
            port: config.get_port() as u16,
            username: config.username.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        }
    }

    pub fn update_auth(&mut self, username: String, password: String) {
        self.username = username;
        self.password = password;
    }

    pub(crate) fn to_opts(&self) -> Opts {
        let mut builder = OptsBuilder::default()
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone());

        builder = match &self.socket {
            Some(path) => builder.socket(Some(path.clone())),
            None => builder
                .ip_or_hostname(self.host.clone())
                .tcp_port(self.port),
        };

        Opts::from(builder)
    }
}

#[cfg(test)]
mod test {
    use super::SessionOptions;

    #[test]
    fn test_socket_wins() {
        let mut opts = SessionOptions::default();
        opts.socket = Some(String::from("/var/run/mysqld/mysqld.sock"));
        let resolved = opts.to_opts();
        assert_eq!(
            resolved.socket(),
            Some("/var/run/mysqld/mysqld.sock")
        );
    }

    #[test]
    fn test_tcp_fallback() {
        let opts = SessionOptions::new(
            String::from("127.0.0.1"),
            3307,
            String::from("osc"),
            String::from("osc"),
        );
        let resolved = opts.to_opts();
        assert_eq!(resolved.tcp_port(), 3307);
        assert_eq!(resolved.user(), Some("osc"));
    }
}
