//! Connection strategies and the attempt log.

use {serde::Serialize, std::fmt};

/// Adapter speeds of the primary backend, tried fastest first.
pub const PRIMARY_SPEEDS_KHZ: [u32; 2] = [480, 100];

/// Reset configuration of a primary-backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetMode {
    /// No reset lines, separate SRST/TRST.
    NoneSeparate,
    /// No reset lines.
    None,
    /// System reset only.
    SrstOnly,
    /// Hold reset while connecting.
    ConnectUnderReset,
}

impl ResetMode {
    /// Matrix order within one speed.
    pub const ALL: [ResetMode; 4] = [
        Self::NoneSeparate,
        Self::None,
        Self::SrstOnly,
        Self::ConnectUnderReset,
    ];

    /// The `reset_config` command for this mode.
    pub fn as_command(self) -> &'static str {
        match self {
            Self::NoneSeparate => "reset_config none separate",
            Self::None => "reset_config none",
            Self::SrstOnly => "reset_config srst_only",
            Self::ConnectUnderReset => "reset_config srst_only srst_nogate connect_assert_srst",
        }
    }
}

impl fmt::Display for ResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            self.as_command()
                .trim_start_matches("reset_config "),
        )
    }
}

/// Which tool an attempt went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Debug-probe server driven through command scripts.
    Primary,
    /// Vendor programming CLI.
    Secondary,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        })
    }
}

/// One point of the connection search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Strategy {
    /// Primary backend at a given speed and reset mode.
    Primary {
        /// Adapter speed.
        speed_khz: u32,
        /// Reset configuration.
        reset: ResetMode,
    },
    /// Secondary backend with a connect token.
    Secondary {
        /// Connect parameters, e.g. `port=SWD mode=UR`.
        token: String,
    },
}

impl Strategy {
    /// The primary matrix: speeds outer, reset modes inner.
    pub fn primary_matrix() -> Vec<Strategy> {
        PRIMARY_SPEEDS_KHZ
            .iter()
            .flat_map(|&speed_khz| {
                ResetMode::ALL
                    .iter()
                    .map(move |&reset| Strategy::Primary { speed_khz, reset })
            })
            .collect()
    }

    /// Backend this strategy runs on.
    pub fn backend(&self) -> Backend {
        match self {
            Self::Primary { .. } => Backend::Primary,
            Self::Secondary { .. } => Backend::Secondary,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary { speed_khz, reset } => write!(f, "{speed_khz} kHz, {reset}"),
            Self::Secondary { token } => write!(f, "{token}"),
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    /// The target was identified.
    Success,
    /// The tool ran but found no core.
    CoreNotFound,
    /// The tool hit its deadline.
    Timeout,
}

/// Diagnostic record of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectAttempt {
    /// Parameters tried.
    pub strategy: Strategy,
    /// Outcome.
    pub outcome: AttemptOutcome,
}

impl ConnectAttempt {
    /// Backend the attempt went through.
    pub fn backend(&self) -> Backend {
        self.strategy
            .backend()
    }
}

impl fmt::Display for ConnectAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {:?}", self.backend(), self.strategy, self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_order_is_speed_major() {
        let matrix = Strategy::primary_matrix();
        assert_eq!(matrix.len(), 8);
        assert_eq!(matrix[0], Strategy::Primary {
            speed_khz: 480,
            reset: ResetMode::NoneSeparate
        });
        assert_eq!(matrix[3], Strategy::Primary {
            speed_khz: 480,
            reset: ResetMode::ConnectUnderReset
        });
        assert_eq!(matrix[4], Strategy::Primary {
            speed_khz: 100,
            reset: ResetMode::NoneSeparate
        });
    }

    #[test]
    fn matrix_has_no_duplicates() {
        let matrix = Strategy::primary_matrix();
        for (i, a) in matrix
            .iter()
            .enumerate()
        {
            assert!(!matrix[i + 1..].contains(a));
        }
    }

    #[test]
    fn attempt_serializes_flat() {
        let attempt = ConnectAttempt {
            strategy: Strategy::Primary {
                speed_khz: 100,
                reset: ResetMode::SrstOnly,
            },
            outcome: AttemptOutcome::CoreNotFound,
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["strategy"]["backend"], "primary");
        assert_eq!(json["strategy"]["speedKhz"], 100);
        assert_eq!(json["strategy"]["reset"], "srst-only");
        assert_eq!(json["outcome"], "coreNotFound");
        assert_eq!(attempt.to_string(), "[primary] 100 kHz, srst_only: CoreNotFound");
    }
}
