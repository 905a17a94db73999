//! Flashable device profiles and best-effort target identification.

use {
    crate::error::{Error, Result},
    regex::Regex,
    serde::Serialize,
    std::{fmt, str::FromStr, sync::LazyLock},
};

/// Known flash targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileId {
    /// Droplet sensor on an STM32WLE5.
    Droplet,
    /// Zone controller on an STM32F030.
    ZoneController,
}

/// Static description of one flash target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    /// Registry key.
    pub id: ProfileId,
    /// Name shown to operators.
    pub display_name: &'static str,
    /// MCU part number.
    pub mcu_name: &'static str,
    /// Target script of the primary backend, under `target/`.
    pub target_config: &'static str,
    /// Flash driver name used for protection commands.
    pub flash_driver: &'static str,
    /// Flash capacity in bytes.
    pub flash_size_bytes: u64,
    /// Where firmware images are written.
    pub flash_base_address: u32,
    /// First of the three UID words.
    pub uid_register_address: u32,
    /// Option-byte register holding the RDP level.
    pub option_bytes_address: u32,
    /// A LoRa device address can be derived from the UID.
    pub supports_derived_address: bool,
}

static PROFILES: [DeviceProfile; 2] = [
    DeviceProfile {
        id: ProfileId::Droplet,
        display_name: "Droplet",
        mcu_name: "STM32WLE5",
        target_config: "stm32wlx.cfg",
        flash_driver: "stm32wlx",
        flash_size_bytes: 256 * 1024,
        flash_base_address: 0x0800_0000,
        uid_register_address: 0x1FFF_7590,
        option_bytes_address: 0x1FFF_7800,
        supports_derived_address: true,
    },
    DeviceProfile {
        id: ProfileId::ZoneController,
        display_name: "Zone Controller",
        mcu_name: "STM32F030C8T6",
        target_config: "stm32f0x.cfg",
        flash_driver: "stm32f0x",
        flash_size_bytes: 64 * 1024,
        flash_base_address: 0x0800_0000,
        uid_register_address: 0x1FFF_F7AC,
        option_bytes_address: 0x1FFF_F800,
        supports_derived_address: false,
    },
];

impl ProfileId {
    /// Every registered profile.
    pub fn all() -> [ProfileId; 2] {
        [Self::Droplet, Self::ZoneController]
    }

    /// The profile's static description.
    pub fn profile(self) -> &'static DeviceProfile {
        match self {
            Self::Droplet => &PROFILES[0],
            Self::ZoneController => &PROFILES[1],
        }
    }

    /// Selector name, e.g. `zone-controller`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Droplet => "droplet",
            Self::ZoneController => "zone-controller",
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            self.profile()
                .display_name,
        )
    }
}

impl FromStr for ProfileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::all()
            .into_iter()
            .find(|p| {
                p.name()
                    .eq_ignore_ascii_case(s)
                    || p.profile()
                        .display_name
                        .eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| Error::InvalidConfig(format!("unknown device profile `{s}`")))
    }
}

static CORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Cortex-(M\d+)").expect("Invalid core regex"));
static DEVICE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)device\s*id\s*[=:]\s*0x([0-9a-f]+)").expect("Invalid device id regex")
});
static FLASH_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)flash size\s*[=:]\s*(\d+)\s*k").expect("Invalid flash size regex")
});

/// Identification markers found in tool output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    /// Core type, e.g. `M4`.
    pub core: Option<String>,
    /// Device-ID register value in upper-case hex, without `0x`.
    pub device_id: Option<String>,
    /// Flash size in KiB, when the tool printed it.
    pub flash_size_kb: Option<u32>,
}

impl Identification {
    /// Scan tool output for identification markers.
    pub fn parse(output: &str) -> Self {
        Self {
            core: CORE_RE
                .captures(output)
                .map(|c| c[1].to_ascii_uppercase()),
            device_id: DEVICE_ID_RE
                .captures(output)
                .map(|c| c[1].to_ascii_uppercase()),
            flash_size_kb: FLASH_SIZE_RE
                .captures(output)
                .and_then(|c| {
                    c[1].parse()
                        .ok()
                }),
        }
    }

    /// A core type or device id was seen.
    ///
    /// This is the partial-success heuristic: a probe run that printed either
    /// marker counts as connected whatever its exit status.
    pub fn is_positive(&self) -> bool {
        self.core
            .is_some()
            || self
                .device_id
                .is_some()
    }
}

/// One identification rule.
#[derive(Debug, Clone, Copy)]
pub enum Rule {
    /// Device id contains the substring.
    DeviceIdContains(&'static str),
    /// Core type equals the name (e.g. `M4`).
    Core(&'static str),
}

impl Rule {
    fn matches(self, id: &Identification) -> bool {
        match self {
            Self::DeviceIdContains(needle) => id
                .device_id
                .as_deref()
                .is_some_and(|d| d.contains(needle)),
            Self::Core(core) => id
                .core
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(core)),
        }
    }
}

/// Ordered identification table; the first matching rule wins.
pub static IDENTIFY_RULES: &[(Rule, ProfileId)] = &[
    (Rule::DeviceIdContains("497"), ProfileId::Droplet),
    (Rule::DeviceIdContains("440"), ProfileId::ZoneController),
    (Rule::DeviceIdContains("444"), ProfileId::ZoneController),
    (Rule::DeviceIdContains("445"), ProfileId::ZoneController),
    (Rule::Core("M4"), ProfileId::Droplet),
    (Rule::Core("M0"), ProfileId::ZoneController),
];

/// Guess the profile from identification markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "profile")]
pub enum DetectedProfile {
    /// A rule matched.
    Known(ProfileId),
    /// No rule matched.
    Unknown,
}

impl DetectedProfile {
    /// Whether this guess contradicts `selected`. Unknown never does.
    pub fn mismatches(self, selected: ProfileId) -> bool {
        matches!(self, Self::Known(id) if id != selected)
    }
}

impl fmt::Display for DetectedProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(id) => id.fmt(f),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Evaluate [`IDENTIFY_RULES`] in order.
pub fn identify(id: &Identification) -> DetectedProfile {
    IDENTIFY_RULES
        .iter()
        .find(|(rule, _)| rule.matches(id))
        .map_or(DetectedProfile::Unknown, |(_, profile)| DetectedProfile::Known(*profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_constants() {
        let droplet = ProfileId::Droplet.profile();
        assert_eq!(droplet.flash_size_bytes, 262_144);
        assert_eq!(droplet.uid_register_address, 0x1FFF_7590);
        assert!(droplet.supports_derived_address);
        let zc = ProfileId::ZoneController.profile();
        assert_eq!(zc.target_config, "stm32f0x.cfg");
        assert!(!zc.supports_derived_address);
        assert_eq!("Zone Controller".parse::<ProfileId>().unwrap(), ProfileId::ZoneController);
        assert!("zc".parse::<ProfileId>().is_err());
    }

    #[test]
    fn parses_primary_output() {
        let out = "Info : stm32wlx.cpu: Cortex-M4 r0p1 processor detected\n\
                   Info : device idcode = 0x10036497 (STM32WLx - Rev 'Z' : 0x1003)\n\
                   Info : device id = 0x10036497\n\
                   Info : flash size = 256 KiB\n";
        let id = Identification::parse(out);
        assert_eq!(id.core.as_deref(), Some("M4"));
        assert_eq!(id.device_id.as_deref(), Some("10036497"));
        assert_eq!(id.flash_size_kb, Some(256));
        assert_eq!(identify(&id), DetectedProfile::Known(ProfileId::Droplet));
    }

    #[test]
    fn parses_secondary_output() {
        let out = "Device ID   : 0x440\nDevice name : STM32F05x/F030x8\nFlash size  : 64 KBytes\nDevice CPU  : Cortex-M0\n";
        let id = Identification::parse(out);
        assert_eq!(id.device_id.as_deref(), Some("440"));
        assert_eq!(id.flash_size_kb, Some(64));
        assert_eq!(identify(&id), DetectedProfile::Known(ProfileId::ZoneController));
    }

    #[test]
    fn device_id_rules_precede_core_rules() {
        let id = Identification {
            core: Some("M0".into()),
            device_id: Some("497".into()),
            flash_size_kb: None,
        };
        assert_eq!(identify(&id), DetectedProfile::Known(ProfileId::Droplet));
    }

    #[test]
    fn unknown_is_total_and_never_mismatches() {
        let id = Identification::parse("Error: init mode failed (unable to connect to the target)");
        assert!(!id.is_positive());
        assert_eq!(identify(&id), DetectedProfile::Unknown);
        assert!(!DetectedProfile::Unknown.mismatches(ProfileId::Droplet));
        assert!(DetectedProfile::Known(ProfileId::ZoneController).mismatches(ProfileId::Droplet));

        let m3 = Identification {
            core: Some("M3".into()),
            ..Identification::default()
        };
        assert!(m3.is_positive());
        assert_eq!(identify(&m3), DetectedProfile::Unknown);
    }
}
