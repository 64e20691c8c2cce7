use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use navrelay_transport::ChannelClientConfig;

/// Program and arguments that launch a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ServerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `<this executable> serve --port <port>`
    pub fn current_exe_serve(port: u16) -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe)
            .arg("serve")
            .arg("--port")
            .arg(port.to_string()))
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Host-side coordination settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub hostname: String,
    pub port: u16,
    /// Bound on one health probe
    pub probe_timeout: Duration,
    /// How long a freshly spawned backend has to answer its health probe
    pub startup_timeout: Duration,
    /// Delay between readiness probes
    pub poll_interval: Duration,
    pub register_timeout: Duration,
    pub unregister_timeout: Duration,
    pub lock_file: PathBuf,
    /// Launch command; `None` runs this executable's `serve` subcommand
    pub server_command: Option<ServerCommand>,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Pause before re-registering after the backend went away
    pub reregister_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            hostname: navrelay_protocol::DEFAULT_HOSTNAME.into(),
            port: navrelay_protocol::DEFAULT_PORT,
            probe_timeout: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
            register_timeout: Duration::from_secs(15),
            unregister_timeout: Duration::from_secs(10),
            lock_file: navrelay_protocol::default_lock_file_path(),
            server_command: None,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            reregister_delay: Duration::from_secs(1),
        }
    }
}

impl CoordinatorConfig {
    pub fn base_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.hostname)
    }

    pub fn channel_config(&self, port: u16) -> ChannelClientConfig {
        ChannelClientConfig {
            connect_attempts: self.connect_attempts,
            retry_delay: self.connect_retry_delay,
            ..ChannelClientConfig::for_port(&self.hostname, port)
        }
    }

    /// The configured launch command, or this executable's `serve`.
    pub fn resolve_server_command(&self) -> std::io::Result<ServerCommand> {
        match &self.server_command {
            Some(command) => Ok(command.clone()),
            None => ServerCommand::current_exe_serve(self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display_joins_args() {
        let cmd = ServerCommand::new("/usr/bin/navrelay").args(["serve", "--port", "9000"]);
        assert_eq!(cmd.to_string(), "/usr/bin/navrelay serve --port 9000");
    }

    #[test]
    fn channel_config_follows_port() {
        let config = CoordinatorConfig {
            connect_attempts: 5,
            ..CoordinatorConfig::default()
        };
        let channel = config.channel_config(9123);
        assert_eq!(channel.url, "ws://127.0.0.1:9123/ipc");
        assert_eq!(channel.connect_attempts, 5);
        assert_eq!(config.base_url(9123), "http://127.0.0.1:9123");
    }

    #[test]
    fn default_command_serves_configured_port() {
        let config = CoordinatorConfig {
            port: 8123,
            ..CoordinatorConfig::default()
        };
        let cmd = config.resolve_server_command().unwrap();
        assert_eq!(cmd.args, ["serve", "--port", "8123"]);
    }
}
