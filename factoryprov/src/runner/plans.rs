//! Built-in test plans for each board type.

use {
    super::{Evaluator, Reading, TestPlan, TestStep},
    crate::{
        error::{Error, Result},
        protocol::{DeviceCommands, TestFamily},
    },
    serde::Serialize,
    std::{fmt, str::FromStr},
};

/// Board types with a factory test plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestProfile {
    /// Micro Edge LoRa sensor node.
    MicroEdge,
    /// ACB-M controller.
    AcbM,
    /// Zone controller with LCD.
    ZcLcd,
    /// Droplet sensor.
    Droplet,
}

impl TestProfile {
    /// Every profile, in menu order.
    pub fn all() -> &'static [TestProfile] {
        &[Self::MicroEdge, Self::AcbM, Self::ZcLcd, Self::Droplet]
    }

    /// Short selector name, e.g. `micro-edge`.
    pub fn name(self) -> &'static str {
        match self {
            Self::MicroEdge => "micro-edge",
            Self::AcbM => "acb-m",
            Self::ZcLcd => "zc-lcd",
            Self::Droplet => "droplet",
        }
    }

    /// Name shown to operators.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::MicroEdge => "Micro Edge",
            Self::AcbM => "ACB-M",
            Self::ZcLcd => "ZC-LCD",
            Self::Droplet => "Droplet",
        }
    }

    /// Look a profile up by selector or display name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::all()
            .iter()
            .copied()
            .find(|p| {
                p.name()
                    .eq_ignore_ascii_case(name)
                    || p.display_name()
                        .eq_ignore_ascii_case(name)
            })
    }

    /// Whether the board expects the unlock handshake after connecting.
    pub fn requires_unlock(self) -> bool {
        !matches!(self, Self::ZcLcd)
    }

    /// The profile's test plan.
    pub fn plan(self) -> TestPlan {
        match self {
            Self::MicroEdge => micro_edge(),
            Self::AcbM => acb_m(),
            Self::ZcLcd => zc_lcd(),
            Self::Droplet => droplet(),
        }
    }
}

impl fmt::Display for TestProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for TestProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| {
            let known: Vec<_> = Self::all()
                .iter()
                .map(|p| p.name())
                .collect();
            Error::InvalidConfig(format!(
                "unknown test profile `{s}` (expected one of {})",
                known.join(", ")
            ))
        })
    }
}

/// `AT+<field>?` evaluated with `evaluator`.
fn field(name: &str, field: &'static str, evaluator: Evaluator) -> TestStep {
    TestStep::new(name, evaluator, move |dev: &dyn DeviceCommands| {
        dev.query_field(field)
            .map(Reading::text)
    })
}

/// Self test `test_<test>` normalized through `family`.
fn self_test(name: &str, test: &'static str, family: TestFamily) -> TestStep {
    TestStep::new(name, Evaluator::DeviceSuccess, move |dev: &dyn DeviceCommands| {
        let result = dev.test_command(test)?;
        let canonical = family.normalize(&result);
        Ok(Reading::text(result.raw)
            .with_value(canonical.to_value())
            .with_device_success(result.success))
    })
}

fn lora_steps(plan: TestPlan) -> TestPlan {
    plan.step(field("loraAddress", "LRRADDRUNQ", Evaluator::Present))
        .step(TestStep::new(
            "loraDetect",
            Evaluator::one_of(&["1"]),
            |dev: &dyn DeviceCommands| {
                let raw = dev.query_field("LORADETECT")?;
                let label = if raw.trim() == "1" { "Detected" } else { "Not Detected" };
                Ok(Reading::text(raw).with_value(label.into()))
            },
        ))
        .step(TestStep::new(
            "loraRawPush",
            Evaluator::one_of(&["OK"]),
            |dev: &dyn DeviceCommands| {
                dev.execute("AT+LORARAWPUSH")
                    .map(|()| Reading::text("OK"))
            },
        ))
}

fn micro_edge() -> TestPlan {
    let plan = TestPlan::new(TestProfile::MicroEdge)
        .step(field("battery", "VALUE_VBAT", Evaluator::volts(2.5, 4.5)))
        .step(field("pulses", "VALUE_PULSE", Evaluator::GreaterThan(3.0)))
        .step(field("dipSwitches", "VALUE_DIPSWITCHES", Evaluator::Informational))
        .step(field("ain1", "VALUE_UI1_RAW", Evaluator::volts(1.4, 1.7)))
        .step(field("ain2", "VALUE_UI2_RAW", Evaluator::volts(0.75, 1.2)))
        .step(field("ain3", "VALUE_UI3_RAW", Evaluator::volts(0.5, 0.9)));
    lora_steps(plan).gate(&["battery", "loraAddress", "loraDetect", "loraRawPush"])
}

fn acb_m() -> TestPlan {
    let plan = TestPlan::new(TestProfile::AcbM)
        .step(field("vcc", "VCCV", Evaluator::Present))
        .step(field("relay1", "RELAY1", Evaluator::Informational))
        .step(field("relay2", "RELAY2", Evaluator::Informational))
        .step(field("digitals", "DIGITALS", Evaluator::Informational))
        .step(field("ain1", "VALUE_UI1_RAW", Evaluator::Informational))
        .step(field("ain2", "VALUE_UI2_RAW", Evaluator::Informational));
    lora_steps(plan)
        .step(field("wifi", "WIFISTATUS", Evaluator::detect(&["ok", "connected", "pass"])))
        .step(field("rs485", "RS485TEST", Evaluator::detect(&["ok", "pass"])))
        .step(field("rs485b", "RS485TEST2", Evaluator::detect(&["ok", "pass"])))
        .step(field("ethernet", "ETHTEST", Evaluator::detect(&["ok", "pass", "link"])))
        .step(field("rtc", "RTCTIME", Evaluator::Informational))
        .gate(&[
            "vcc",
            "loraAddress",
            "loraDetect",
            "loraRawPush",
            "wifi",
            "rs485",
            "ethernet",
        ])
}

fn zc_lcd() -> TestPlan {
    TestPlan::new(TestProfile::ZcLcd)
        .step(field("lcdInfo", "LCDINFO", Evaluator::Present))
        .step(field("backlight", "BACKLIGHT", Evaluator::Informational))
        .step(field("buttons", "BTNSTATUS", Evaluator::Informational))
        .step(self_test("wifi", "wifi", TestFamily::Wifi))
        .step(self_test("i2c", "i2c", TestFamily::Environmental))
        .step(self_test("rs485", "rs485", TestFamily::BusLoopback))
        .gate(&["wifi", "i2c", "rs485"])
}

fn droplet() -> TestPlan {
    lora_steps(TestPlan::new(TestProfile::Droplet))
        .step(field("battery", "VALUE_VBAT", Evaluator::volts(2.5, 4.5)))
        .gate(&["loraAddress", "loraDetect", "loraRawPush", "battery"])
}
