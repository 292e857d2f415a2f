//! Traffic control (netem) via tc
//!
//! Renders netem qdisc operations to `tc` invocations that the Manager runs
//! inside the owning container's namespace. Delay distributions are
//! referenced by name and resolved against tc's distribution table
//! directory; custom table marshalling is out of scope.

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum QdiscError {
    #[error("Invalid netem configuration: {0}")]
    InvalidConfig(String),

    #[error("tc exited with status {0}")]
    CommandFailed(i32),

    #[error("Failed to run tc: {0}")]
    Io(#[from] std::io::Error),
}

/// Network emulation parameters. Zero means "not set".
#[derive(Clone, Debug, Default)]
pub struct NetemSpec {
    /// Base delay in microseconds.
    pub delay_us: u32,
    /// Delay jitter in microseconds (standard deviation).
    pub jitter_us: u32,
    /// Loss percentage (0.0-100.0).
    pub loss_pct: f32,
    /// Rate limit in kilobits per second.
    pub rate_kbps: u64,
    /// Named delay distribution (e.g. "normal", "pareto").
    pub distribution: Option<String>,
}

/// Qdisc operation verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcAction {
    Add,
    Replace,
    Del,
}

impl TcAction {
    fn verb(self) -> &'static str {
        match self {
            TcAction::Add => "add",
            TcAction::Replace => "replace",
            TcAction::Del => "del",
        }
    }
}

/// Build the tc argv for a netem operation on `iface`'s root qdisc.
pub(crate) fn netem_args(
    action: TcAction,
    iface: &str,
    spec: &NetemSpec,
) -> Result<Vec<String>, QdiscError> {
    let mut args: Vec<String> = ["tc", "qdisc", action.verb(), "dev"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(iface.to_string());
    args.push("root".to_string());

    if action == TcAction::Del {
        return Ok(args);
    }

    if spec.jitter_us > 0 && spec.delay_us == 0 {
        return Err(QdiscError::InvalidConfig(
            "jitter requires a base delay".to_string(),
        ));
    }
    if spec.distribution.is_some() && spec.jitter_us == 0 {
        return Err(QdiscError::InvalidConfig(
            "a delay distribution requires jitter".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&spec.loss_pct) {
        return Err(QdiscError::InvalidConfig(format!(
            "loss {}% out of range",
            spec.loss_pct
        )));
    }

    args.push("netem".to_string());
    if spec.delay_us > 0 {
        args.push("delay".to_string());
        args.push(format!("{}us", spec.delay_us));
        if spec.jitter_us > 0 {
            args.push(format!("{}us", spec.jitter_us));
        }
        if let Some(dist) = &spec.distribution {
            args.push("distribution".to_string());
            args.push(dist.clone());
        }
    }
    if spec.loss_pct > 0.0 {
        args.push("loss".to_string());
        args.push(format!("{}%", spec.loss_pct));
    }
    if spec.rate_kbps > 0 {
        args.push("rate".to_string());
        args.push(format!("{}kbit", spec.rate_kbps));
    }
    Ok(args)
}

/// Run a tc command in the root namespace.
pub(crate) async fn run_tc_root(args: &[String]) -> Result<(), QdiscError> {
    debug!("Running {:?}", args);
    let status = Command::new(&args[0]).args(&args[1..]).status().await?;
    if !status.success() {
        return Err(QdiscError::CommandFailed(status.code().unwrap_or(-1)));
    }
    info!("Applied {:?}", args);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_with_delay_and_jitter() {
        let spec = NetemSpec {
            delay_us: 10000,
            jitter_us: 2000,
            ..Default::default()
        };
        let args = netem_args(TcAction::Add, "eth0", &spec).unwrap();
        assert_eq!(
            args,
            vec![
                "tc", "qdisc", "add", "dev", "eth0", "root", "netem", "delay", "10000us",
                "2000us"
            ]
        );
    }

    #[test]
    fn replace_with_distribution_loss_and_rate() {
        let spec = NetemSpec {
            delay_us: 5000,
            jitter_us: 1000,
            loss_pct: 1.5,
            rate_kbps: 8000,
            distribution: Some("pareto".to_string()),
        };
        let args = netem_args(TcAction::Replace, "eth1", &spec).unwrap();
        assert_eq!(
            args,
            vec![
                "tc",
                "qdisc",
                "replace",
                "dev",
                "eth1",
                "root",
                "netem",
                "delay",
                "5000us",
                "1000us",
                "distribution",
                "pareto",
                "loss",
                "1.5%",
                "rate",
                "8000kbit"
            ]
        );
    }

    #[test]
    fn del_ignores_spec() {
        let args = netem_args(TcAction::Del, "eth0", &NetemSpec::default()).unwrap();
        assert_eq!(args, vec!["tc", "qdisc", "del", "dev", "eth0", "root"]);
    }

    #[test]
    fn jitter_without_delay_is_rejected() {
        let spec = NetemSpec {
            jitter_us: 100,
            ..Default::default()
        };
        assert!(matches!(
            netem_args(TcAction::Add, "eth0", &spec),
            Err(QdiscError::InvalidConfig(_))
        ));
    }

    #[test]
    fn distribution_without_jitter_is_rejected() {
        let spec = NetemSpec {
            delay_us: 1000,
            distribution: Some("normal".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            netem_args(TcAction::Add, "eth0", &spec),
            Err(QdiscError::InvalidConfig(_))
        ));
    }
}
