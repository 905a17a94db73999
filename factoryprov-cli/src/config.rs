//! Configuration file support for factoryprov.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FACTORYPROV_*)
//! 3. Local config file (./factoryprov.toml)
//! 4. Global config file (~/.config/factoryprov/config.toml)

use {
    directories::ProjectDirs,
    factoryprov::{
        ChannelOptions, FlashSettings,
        process::{DEFAULT_DIAGNOSTICS_FILE, DiagnosticsLog, SystemRunner},
        protocol::DEFAULT_UNLOCK_SECRET,
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "factoryprov.toml";

/// Default baud rate of the board's command port.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialSection {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Factory test settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactorySection {
    /// Secret sent with the unlock handshake.
    pub unlock_secret: Option<String>,
    /// Deadline of ordinary AT queries, in milliseconds.
    pub command_timeout_ms: Option<u64>,
    /// Deadline of hardware self tests, in milliseconds.
    pub test_timeout_ms: Option<u64>,
}

/// Flash tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashSection {
    /// Primary debug server executable.
    pub openocd: Option<PathBuf>,
    /// Script directory of the primary tool.
    pub scripts: Option<PathBuf>,
    /// Adapter interface script, e.g. `interface/stlink.cfg`.
    pub interface: Option<String>,
    /// Vendor programming CLI executable.
    pub cube_cli: Option<PathBuf>,
    /// Version byte folded into derived addresses.
    pub version_byte: Option<u8>,
    /// Diagnostics log path; an empty string disables the log.
    pub diagnostics_log: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial connection.
    #[serde(default)]
    pub serial: SerialSection,
    /// Factory test settings.
    #[serde(default)]
    pub factory: FactorySection,
    /// Flash tool settings.
    #[serde(default)]
    pub flash: FlashSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "factoryprov").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.serial.port, other.serial.port);
        take(&mut self.serial.baud, other.serial.baud);

        take(&mut self.factory.unlock_secret, other.factory.unlock_secret);
        take(&mut self.factory.command_timeout_ms, other.factory.command_timeout_ms);
        take(&mut self.factory.test_timeout_ms, other.factory.test_timeout_ms);

        take(&mut self.flash.openocd, other.flash.openocd);
        take(&mut self.flash.scripts, other.flash.scripts);
        take(&mut self.flash.interface, other.flash.interface);
        take(&mut self.flash.cube_cli, other.flash.cube_cli);
        take(&mut self.flash.version_byte, other.flash.version_byte);
        take(&mut self.flash.diagnostics_log, other.flash.diagnostics_log);
    }

    /// Baud rate: explicit value, then config, then the default.
    pub fn baud(&self, explicit: Option<u32>) -> u32 {
        explicit
            .or(self.serial.baud)
            .unwrap_or(DEFAULT_BAUD)
    }

    /// Unlock secret for boards that need the handshake.
    pub fn unlock_secret(&self) -> &str {
        self.factory
            .unlock_secret
            .as_deref()
            .unwrap_or(DEFAULT_UNLOCK_SECRET)
    }

    /// Channel timing with configured overrides applied.
    pub fn channel_options(&self) -> ChannelOptions {
        let mut options = ChannelOptions::default();
        if let Some(ms) = self
            .factory
            .command_timeout_ms
        {
            options = options.with_command_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self
            .factory
            .test_timeout_ms
        {
            options = options.with_test_timeout(Duration::from_millis(ms));
        }
        options
    }

    /// Flash settings with configured overrides applied.
    pub fn flash_settings(&self) -> FlashSettings {
        let mut settings = FlashSettings::default();
        if let Some(path) = &self
            .flash
            .openocd
        {
            settings = settings.with_openocd(path);
        }
        if let Some(path) = &self
            .flash
            .scripts
        {
            settings = settings.with_scripts(path);
        }
        if let Some(interface) = &self
            .flash
            .interface
        {
            settings = settings.with_interface(interface);
        }
        if let Some(path) = &self
            .flash
            .cube_cli
        {
            settings = settings.with_cube_cli(path);
        }
        if let Some(version_byte) = self
            .flash
            .version_byte
        {
            settings = settings.with_version_byte(version_byte);
        }
        settings
    }

    /// Tool runner writing to the configured diagnostics log.
    pub fn tool_runner(&self) -> SystemRunner {
        let path = self
            .flash
            .diagnostics_log
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIAGNOSTICS_FILE));
        if path
            .as_os_str()
            .is_empty()
        {
            debug!("Diagnostics log disabled");
            SystemRunner::new()
        } else {
            SystemRunner::new().with_diagnostics(DiagnosticsLog::new(path))
        }
    }

    /// Remember `port` in the local config file.
    pub fn remember_port(&mut self, port: &str) -> anyhow::Result<()> {
        let path = Path::new(LOCAL_CONFIG_FILE);
        let mut local = Self::load_from_file(path).unwrap_or_default();
        local.serial.port = Some(port.to_string());
        fs::write(path, toml::to_string_pretty(&local)?)?;
        self.serial.port = Some(port.to_string());
        info!("Saved port {port} to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.serial.port.is_none());
        assert_eq!(config.baud(None), 115_200);
        assert_eq!(config.unlock_secret(), DEFAULT_UNLOCK_SECRET);
        let settings = config.flash_settings();
        assert_eq!(settings.version_byte, 0xC0);
        assert_eq!(settings.interface, "interface/stlink.cfg");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[serial]
port = "/dev/ttyUSB0"
baud = 57600

[factory]
unlock_secret = "S3CRET"
command_timeout_ms = 2000

[flash]
openocd = "/opt/openocd/bin/openocd"
scripts = "/opt/openocd/scripts"
version_byte = 193
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baud(None), 57600);
        assert_eq!(config.baud(Some(9600)), 9600);
        assert_eq!(config.unlock_secret(), "S3CRET");
        assert_eq!(config.channel_options().command_timeout, Duration::from_secs(2));

        let settings = config.flash_settings();
        assert_eq!(settings.openocd, PathBuf::from("/opt/openocd/bin/openocd"));
        assert_eq!(settings.scripts, PathBuf::from("/opt/openocd/scripts"));
        assert_eq!(settings.version_byte, 0xC1);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.serial.baud.is_none());
        assert!(config.flash.openocd.is_none());
    }

    #[test]
    fn test_config_merge_keeps_unset_fields() {
        let mut base = Config::default();
        base.serial.port = Some("COM3".to_string());
        base.flash.version_byte = Some(0xC0);

        let mut other = Config::default();
        other.flash.version_byte = Some(0xC2);
        other.factory.test_timeout_ms = Some(30_000);
        base.merge(other);

        assert_eq!(base.serial.port.as_deref(), Some("COM3"));
        assert_eq!(base.flash.version_byte, Some(0xC2));
        assert_eq!(base.channel_options().test_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_path_valid_and_invalid() {
        let dir = tempdir().unwrap();
        let good = dir
            .path()
            .join("good.toml");
        fs::write(&good, "[serial]\nport = \"/dev/ttyACM0\"\n").unwrap();
        assert_eq!(
            Config::load_from_path(&good)
                .serial
                .port
                .as_deref(),
            Some("/dev/ttyACM0")
        );

        let bad = dir
            .path()
            .join("bad.toml");
        fs::write(&bad, "invalid toml [[[").unwrap();
        assert!(
            Config::load_from_path(&bad)
                .serial
                .port
                .is_none()
        );
    }

    #[test]
    fn test_global_config_path_names_the_tool() {
        if let Some(p) = Config::global_config_path() {
            let s = p.to_string_lossy();
            assert!(s.contains("factoryprov"));
            assert!(s.ends_with("config.toml"));
        }
    }
}
