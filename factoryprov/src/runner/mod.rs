//! Factory test execution.
//!
//! A [`TestPlan`] is an ordered list of steps bound to one [`TestProfile`].
//! [`FactoryTestRunner`] executes the steps one at a time over a single
//! [`DeviceCommands`] implementation, evaluates each raw reading and always
//! returns a complete [`TestReport`]: a step that errors is recorded with
//! [`TestStatus::Error`] and the run continues.

mod evaluate;
mod plans;

pub use {
    evaluate::{
        Evaluation, Evaluator, NORMALIZED_LIMIT, REFERENCE_VOLTAGE, Reading, Verdict,
        normalize_volts, parse_volts,
    },
    plans::TestProfile,
};

#[cfg(feature = "native")]
use crate::{
    channel::{ChannelOptions, SerialChannel},
    port::SerialConfig,
    protocol::CommandProtocol,
};
use {
    crate::{
        error::Result,
        protocol::{DeviceCommands, DeviceInfo, read_device_info},
    },
    log::{info, warn},
    serde::{Serialize, Serializer, ser::SerializeMap},
    serde_json::Value,
    std::fmt,
};

/// Closure that performs one test step against a device.
pub type InvokeFn = Box<dyn Fn(&dyn DeviceCommands) -> Result<Reading> + Send + Sync>;

/// One entry of a test plan.
pub struct TestStep {
    name: String,
    invoke: InvokeFn,
    evaluator: Evaluator,
}

impl TestStep {
    /// Create a step from a name, an invocation and an evaluator.
    pub fn new<F>(name: impl Into<String>, evaluator: Evaluator, invoke: F) -> Self
    where
        F: Fn(&dyn DeviceCommands) -> Result<Reading> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            invoke: Box::new(invoke),
            evaluator,
        }
    }

    /// Step name, unique within its plan.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The evaluator applied to this step's reading.
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn execute(&self, device: &dyn DeviceCommands) -> TestResult {
        match (self.invoke)(device) {
            Ok(reading) => {
                let evaluation = self
                    .evaluator
                    .evaluate(&reading);
                TestResult {
                    name: self
                        .name
                        .clone(),
                    raw_text: reading.text,
                    parsed_value: evaluation
                        .value
                        .or(reading.value),
                    status: evaluation
                        .verdict
                        .into(),
                    message: evaluation.message,
                }
            },
            Err(e) => TestResult {
                name: self
                    .name
                    .clone(),
                raw_text: String::new(),
                parsed_value: None,
                status: TestStatus::Error,
                message: e.to_string(),
            },
        }
    }
}

impl fmt::Debug for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStep")
            .field("name", &self.name)
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

/// Ordered steps for one profile plus the names that gate `pass_all`.
#[derive(Debug)]
pub struct TestPlan {
    profile: TestProfile,
    steps: Vec<TestStep>,
    gate: Vec<String>,
}

impl TestPlan {
    /// Empty plan for `profile`.
    pub fn new(profile: TestProfile) -> Self {
        Self {
            profile,
            steps: Vec::new(),
            gate: Vec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: TestStep) -> Self {
        self.steps
            .push(step);
        self
    }

    /// Set the result names that must all pass for `pass_all`.
    #[must_use]
    pub fn gate(mut self, names: &[&str]) -> Self {
        self.gate = names
            .iter()
            .map(|n| (*n).to_string())
            .collect();
        self
    }

    /// Profile this plan belongs to.
    pub fn profile(&self) -> TestProfile {
        self.profile
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Gating result names.
    pub fn gate_names(&self) -> &[String] {
        &self.gate
    }
}

/// Lifecycle status of a single test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Recorded without a verdict.
    Pending,
    /// Within limits.
    Pass,
    /// Out of limits.
    Fail,
    /// The step itself failed (timeout, command error).
    Error,
}

impl From<Verdict> for TestStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Pass => Self::Pass,
            Verdict::Fail => Self::Fail,
            Verdict::Indeterminate => Self::Pending,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
        })
    }
}

/// Finalized result of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Step name.
    pub name: String,
    /// Reading as the device reported it.
    pub raw_text: String,
    /// Interpreted value, if any.
    pub parsed_value: Option<Value>,
    /// Verdict.
    pub status: TestStatus,
    /// Explanation for operators.
    pub message: String,
}

impl TestResult {
    /// Value shown in exported rows: the interpreted value when it is a
    /// scalar, else the raw text, or `ERROR` when the step errored.
    pub fn display_value(&self) -> String {
        if self.status == TestStatus::Error {
            return crate::protocol::ERROR_VALUE.to_string();
        }
        match &self.parsed_value {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n
                .as_f64()
                .map_or_else(|| n.to_string(), |f| format!("{f:.2}")),
            Some(Value::Bool(b)) => b.to_string(),
            _ => self
                .raw_text
                .clone(),
        }
    }
}

/// Aggregate outcome of one plan run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// Profile the plan belonged to.
    pub profile: TestProfile,
    /// Results in plan order.
    #[serde(serialize_with = "results_as_map")]
    pub results: Vec<TestResult>,
    /// Every gating result passed.
    pub pass_all: bool,
    /// Identification fields read before the plan.
    pub info: DeviceInfo,
}

impl TestReport {
    /// Result by step name.
    pub fn get(&self, name: &str) -> Option<&TestResult> {
        self.results
            .iter()
            .find(|r| r.name == name)
    }

    /// Ordered `(column, value)` pairs of one exported CSV row.
    pub fn summary_row(&self) -> Vec<(String, String)> {
        let mut row = vec![
            ("profile".to_string(), self.profile.display_name().to_string()),
            ("uniqueId".to_string(), self.info.unique_id.clone()),
            ("firmwareVersion".to_string(), self.info.firmware_version.clone()),
            ("hwVersion".to_string(), self.info.hw_version.clone()),
            ("deviceMake".to_string(), self.info.device_make.clone()),
            ("deviceModel".to_string(), self.info.device_model.clone()),
        ];
        row.extend(
            self.results
                .iter()
                .map(|r| (r.name.clone(), r.display_value())),
        );
        row.push((
            "result".to_string(),
            if self.pass_all { "PASS" } else { "FAIL" }.to_string(),
        ));
        row
    }
}

fn results_as_map<S: Serializer>(
    results: &[TestResult],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(results.len()))?;
    for result in results {
        map.serialize_entry(&result.name, result)?;
    }
    map.end()
}

/// Runs test plans against one device.
pub struct FactoryTestRunner<'a> {
    device: &'a dyn DeviceCommands,
}

impl<'a> FactoryTestRunner<'a> {
    /// Runner over `device`.
    pub fn new(device: &'a dyn DeviceCommands) -> Self {
        Self { device }
    }

    /// Run every step of `plan` in order.
    pub fn run(&self, plan: &TestPlan) -> TestReport {
        self.run_observed(plan, &mut |_| {})
    }

    /// Run every step of `plan`, reporting each result as it completes.
    pub fn run_observed(
        &self,
        plan: &TestPlan,
        observer: &mut dyn FnMut(&TestResult),
    ) -> TestReport {
        info!("Running {} factory tests", plan.profile());
        let info = read_device_info(self.device);

        let mut results = Vec::with_capacity(
            plan.steps()
                .len(),
        );
        for step in plan.steps() {
            let result = step.execute(self.device);
            match result.status {
                TestStatus::Error => warn!("{}: error: {}", result.name, result.message),
                status => info!("{}: {status} ({})", result.name, result.message),
            }
            observer(&result);
            results.push(result);
        }

        let pass_all = !plan
            .gate_names()
            .is_empty()
            && plan
                .gate_names()
                .iter()
                .all(|name| {
                    results
                        .iter()
                        .any(|r| &r.name == name && r.status == TestStatus::Pass)
                });

        TestReport {
            profile: plan.profile(),
            results,
            pass_all,
            info,
        }
    }
}

/// Open `config`, unlock when the profile needs it, run the profile's plan
/// and close the port again.
#[cfg(feature = "native")]
pub fn run_session(
    config: &SerialConfig,
    options: ChannelOptions,
    profile: TestProfile,
    unlock_secret: &str,
    observer: &mut dyn FnMut(&TestResult),
) -> Result<TestReport> {
    let channel = if profile.requires_unlock() {
        SerialChannel::open_unlocked(config, options, unlock_secret)?
    } else {
        SerialChannel::open(config, options)?
    };
    let protocol = CommandProtocol::new(channel);
    let plan = profile.plan();
    let report = FactoryTestRunner::new(&protocol).run_observed(&plan, observer);
    protocol.close();
    Ok(report)
}
