//! Pass/fail evaluators applied to raw test readings.

use {
    crate::protocol::{ERROR_VALUE, parse_number},
    serde_json::Value,
    std::fmt,
};

/// Reference voltage used to scale normalized ADC readings.
pub const REFERENCE_VOLTAGE: f64 = 3.3;

/// Readings at or below this magnitude are normalized fractions.
pub const NORMALIZED_LIMIT: f64 = 1.05;

/// Interpret a voltage-like reading.
///
/// Some firmware reports raw ADC fractions and some reports volts: a value
/// whose magnitude is at most [`NORMALIZED_LIMIT`] is scaled by
/// [`REFERENCE_VOLTAGE`], anything larger is already in volts.
pub fn normalize_volts(reading: f64) -> f64 {
    if reading.abs() <= NORMALIZED_LIMIT {
        reading * REFERENCE_VOLTAGE
    } else {
        reading
    }
}

/// Parse a reading such as `"0.50"` or `"3.61 V"` and normalize it to volts.
pub fn parse_volts(text: &str) -> Option<f64> {
    parse_number(text)
        .ok()
        .map(normalize_volts)
}

/// Words that mark a status line as failed whatever else it says.
pub const NEGATIVE_WORDS: [&str; 8] = [
    "not",
    "no",
    "disconnected",
    "down",
    "fail",
    "failed",
    "error",
    "timeout",
];

/// Lower-cased alphanumeric words of `text`.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Verdict of one evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Reading is within limits.
    Pass,
    /// Reading is out of limits.
    Fail,
    /// Informational reading, no verdict.
    Indeterminate,
}

/// Raw reading produced by a test step.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Text as the device reported it.
    pub text: String,
    /// Structured value, when the step produced one.
    pub value: Option<Value>,
    /// Device-reported success, for self tests that report one.
    pub device_success: Option<bool>,
}

impl Reading {
    /// Plain text reading.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            value: None,
            device_success: None,
        }
    }

    /// Attach a structured value.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Attach the device's own success flag.
    #[must_use]
    pub fn with_device_success(mut self, success: bool) -> Self {
        self.device_success = Some(success);
        self
    }
}

/// Result of applying an evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// The verdict.
    pub verdict: Verdict,
    /// Interpreted value (e.g. the normalized voltage).
    pub value: Option<Value>,
    /// Human-readable explanation.
    pub message: String,
}

impl Evaluation {
    fn new(verdict: Verdict, value: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            verdict,
            value,
            message: message.into(),
        }
    }
}

/// Closed set of reading checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluator {
    /// Inclusive numeric range; `volts` applies [`normalize_volts`] first.
    Range {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Treat the reading as a voltage.
        volts: bool,
    },
    /// Strictly greater than the threshold.
    GreaterThan(f64),
    /// Text has one of the needles as a whole word (case-insensitive) and
    /// none of the [`NEGATIVE_WORDS`].
    Detect(Vec<String>),
    /// Text equals one of the accepted answers (case-insensitive).
    OneOf(Vec<String>),
    /// Any reading other than empty or `ERROR`.
    Present,
    /// The device's own success flag.
    DeviceSuccess,
    /// Recorded, never judged.
    Informational,
}

impl Evaluator {
    /// Inclusive range on a plain number.
    pub fn range(min: f64, max: f64) -> Self {
        Self::Range {
            min,
            max,
            volts: false,
        }
    }

    /// Inclusive range on a voltage-like reading.
    pub fn volts(min: f64, max: f64) -> Self {
        Self::Range {
            min,
            max,
            volts: true,
        }
    }

    /// Whole-word status check against any of `needles`.
    pub fn detect(needles: &[&str]) -> Self {
        Self::Detect(
            needles
                .iter()
                .map(|n| n.to_ascii_lowercase())
                .collect(),
        )
    }

    /// Exact-match check against any of `answers`.
    pub fn one_of(answers: &[&str]) -> Self {
        Self::OneOf(
            answers
                .iter()
                .map(|a| (*a).to_string())
                .collect(),
        )
    }

    /// Apply the check to a reading.
    pub fn evaluate(&self, reading: &Reading) -> Evaluation {
        let text = reading
            .text
            .trim();
        match self {
            Self::Range { min, max, volts } => match parse_number(text) {
                Ok(raw) => {
                    let value = if *volts { normalize_volts(raw) } else { raw };
                    let verdict = if (*min..=*max).contains(&value) {
                        Verdict::Pass
                    } else {
                        Verdict::Fail
                    };
                    Evaluation::new(
                        verdict,
                        Some(Value::from(value)),
                        format!("{value:.2} (expected {min}..={max})"),
                    )
                },
                Err(_) => Evaluation::new(Verdict::Fail, None, format!("not a number: `{text}`")),
            },
            Self::GreaterThan(threshold) => match parse_number(text) {
                Ok(value) if value > *threshold => {
                    Evaluation::new(
                        Verdict::Pass,
                        Some(Value::from(value)),
                        format!("{value} > {threshold}"),
                    )
                },
                Ok(value) => Evaluation::new(
                    Verdict::Fail,
                    Some(Value::from(value)),
                    format!("{value} is not above {threshold}"),
                ),
                Err(_) => Evaluation::new(Verdict::Fail, None, format!("not a number: `{text}`")),
            },
            Self::Detect(needles) => {
                if let Some(negative) = words(text).find(|w| {
                    NEGATIVE_WORDS.contains(&w.as_str())
                }) {
                    return Evaluation::new(
                        Verdict::Fail,
                        reading.value.clone(),
                        format!("`{text}` reports `{negative}`"),
                    );
                }
                if words(text).any(|w| needles.contains(&w)) {
                    Evaluation::new(Verdict::Pass, reading.value.clone(), text)
                } else {
                    Evaluation::new(
                        Verdict::Fail,
                        reading.value.clone(),
                        format!("`{text}` does not mention {}", needles.join("/")),
                    )
                }
            },
            Self::OneOf(answers) => {
                if answers
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(text))
                {
                    Evaluation::new(Verdict::Pass, reading.value.clone(), text)
                } else {
                    Evaluation::new(
                        Verdict::Fail,
                        reading.value.clone(),
                        format!("unexpected answer `{text}`"),
                    )
                }
            },
            Self::Present => {
                if text.is_empty() || text.eq_ignore_ascii_case(ERROR_VALUE) {
                    Evaluation::new(Verdict::Fail, None, "no value reported")
                } else {
                    Evaluation::new(Verdict::Pass, reading.value.clone(), text)
                }
            },
            Self::DeviceSuccess => match reading.device_success {
                Some(true) => {
                    Evaluation::new(Verdict::Pass, reading.value.clone(), "device reported success")
                },
                Some(false) => {
                    Evaluation::new(Verdict::Fail, reading.value.clone(), "device reported failure")
                },
                None => Evaluation::new(
                    Verdict::Indeterminate,
                    reading.value.clone(),
                    "device did not report a result",
                ),
            },
            Self::Informational => {
                Evaluation::new(Verdict::Indeterminate, reading.value.clone(), text)
            },
        }
    }
}

impl fmt::Display for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { min, max, volts: true } => write!(f, "{min}..={max} V"),
            Self::Range { min, max, volts: false } => write!(f, "{min}..={max}"),
            Self::GreaterThan(t) => write!(f, "> {t}"),
            Self::Detect(needles) => write!(f, "has word {}", needles.join("|")),
            Self::OneOf(answers) => write!(f, "one of {}", answers.join("|")),
            Self::Present => f.write_str("present"),
            Self::DeviceSuccess => f.write_str("device success"),
            Self::Informational => f.write_str("informational"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(evaluator: &Evaluator, text: &str) -> Verdict {
        evaluator
            .evaluate(&Reading::text(text))
            .verdict
    }

    #[test]
    fn normalized_and_scaled_readings_agree() {
        let ain = Evaluator::volts(1.55, 1.75);
        let scaled = ain.evaluate(&Reading::text("0.50"));
        let direct = ain.evaluate(&Reading::text("1.65"));
        assert_eq!(scaled.verdict, Verdict::Pass);
        assert_eq!(direct.verdict, Verdict::Pass);
        let a = scaled
            .value
            .and_then(|v| v.as_f64())
            .unwrap();
        let b = direct
            .value
            .and_then(|v| v.as_f64())
            .unwrap();
        assert!((a - 1.65).abs() < 1e-9);
        assert!((b - 1.65).abs() < 1e-9);

        let bare = ain.evaluate(&Reading::text(".50"));
        assert_eq!(bare.verdict, Verdict::Pass);
        let c = bare
            .value
            .and_then(|v| v.as_f64())
            .unwrap();
        assert!((c - 1.65).abs() < 1e-9);
    }

    #[test]
    fn normalization_boundary() {
        assert!((normalize_volts(1.05) - 3.465).abs() < 1e-9);
        assert!((normalize_volts(1.06) - 1.06).abs() < 1e-9);
        assert!((normalize_volts(-0.5) + 1.65).abs() < 1e-9);
        assert_eq!(parse_volts("n/a"), None);
    }

    #[test]
    fn battery_range_is_inclusive() {
        let battery = Evaluator::volts(3.45, 3.70);
        assert_eq!(verdict(&battery, "3.55"), Verdict::Pass);
        assert_eq!(verdict(&battery, "3.71"), Verdict::Fail);
        assert_eq!(verdict(&battery, "3.70"), Verdict::Pass);
        assert_eq!(verdict(&battery, "3.45 V"), Verdict::Pass);
    }

    #[test]
    fn unparseable_range_reading_fails() {
        let eval = Evaluator::range(0.0, 10.0).evaluate(&Reading::text("ERROR"));
        assert_eq!(eval.verdict, Verdict::Fail);
        assert!(eval.value.is_none());
    }

    #[test]
    fn greater_than_is_strict() {
        let pulses = Evaluator::GreaterThan(3.0);
        assert_eq!(verdict(&pulses, "4"), Verdict::Pass);
        assert_eq!(verdict(&pulses, "3"), Verdict::Fail);
    }

    #[test]
    fn detect_matches_whole_words() {
        let eval = Evaluator::detect(&["connected"]);
        assert_eq!(verdict(&eval, "WIFI CONNECTED rssi=-60"), Verdict::Pass);
        assert_eq!(verdict(&eval, "idle"), Verdict::Fail);
        assert_eq!(verdict(&eval, "DISCONNECTED"), Verdict::Fail);
        assert_eq!(verdict(&eval, "unconnectedness"), Verdict::Fail);
    }

    #[test]
    fn detect_negative_words_win() {
        let bus = Evaluator::detect(&["ok", "pass"]);
        assert_eq!(verdict(&bus, "OK"), Verdict::Pass);
        assert_eq!(verdict(&bus, "NOT OK"), Verdict::Fail);
        assert_eq!(verdict(&bus, "pass: no"), Verdict::Fail);
        assert_eq!(verdict(&bus, "ok, error on retry"), Verdict::Fail);

        let link = Evaluator::detect(&["ok", "pass", "link"]);
        assert_eq!(verdict(&link, "LINK UP"), Verdict::Pass);
        assert_eq!(verdict(&link, "LINK DOWN"), Verdict::Fail);
        assert!(
            Evaluator::detect(&["ok"])
                .evaluate(&Reading::text("NOT OK"))
                .message
                .contains("`not`")
        );
    }

    #[test]
    fn one_of_is_exact() {
        let eval = Evaluator::one_of(&["1"]);
        assert_eq!(verdict(&eval, "1"), Verdict::Pass);
        assert_eq!(verdict(&eval, "10"), Verdict::Fail);
    }

    #[test]
    fn present_rejects_error_placeholder() {
        assert_eq!(verdict(&Evaluator::Present, "A1B2C3D4"), Verdict::Pass);
        assert_eq!(verdict(&Evaluator::Present, "ERROR"), Verdict::Fail);
        assert_eq!(verdict(&Evaluator::Present, ""), Verdict::Fail);
    }

    #[test]
    fn device_success_and_informational() {
        let ok = Reading::text("{}").with_device_success(true);
        let bad = Reading::text("{}").with_device_success(false);
        assert_eq!(Evaluator::DeviceSuccess.evaluate(&ok).verdict, Verdict::Pass);
        assert_eq!(Evaluator::DeviceSuccess.evaluate(&bad).verdict, Verdict::Fail);
        assert_eq!(verdict(&Evaluator::Informational, "0101"), Verdict::Indeterminate);
    }

    #[test]
    fn display_describes_thresholds() {
        assert_eq!(Evaluator::volts(1.4, 1.7).to_string(), "1.4..=1.7 V");
        assert_eq!(Evaluator::GreaterThan(3.0).to_string(), "> 3");
    }
}
