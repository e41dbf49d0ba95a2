// Structured events for every sysfs mutation attempt and session transition.
// Consumers either subscribe to the tracing target or to the session broadcast.

use crate::pci::{BindingState, PciAddress};
use crate::privileged::PrivilegedOp;
use crate::session::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_TARGET: &str = "nova_passthrough::events";

/// One session state transition, as published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub vm_name: String,
    pub group_id: Option<u32>,
    pub functions: Vec<PciAddress>,
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl SessionEvent {
    pub fn emit(&self) {
        let functions = format_addresses(&self.functions);
        let outcome = if matches!(self.to, Phase::Failed(_)) {
            "failed"
        } else {
            "ok"
        };
        tracing::info!(
            target: EVENT_TARGET,
            event = "transition",
            session = %self.session_id,
            vm = %self.vm_name,
            group = ?self.group_id,
            functions = %functions,
            from = %self.from,
            to = %self.to,
            outcome,
            detail = self.detail.as_deref().unwrap_or(""),
            "session transition"
        );
    }
}

/// One privileged mutation attempt against a group.
#[derive(Debug, Clone)]
pub struct Mutation<'a> {
    pub group: u32,
    pub op: &'a PrivilegedOp,
    /// Binding of the addressed function right before the write.
    pub from: Option<BindingState>,
}

impl Mutation<'_> {
    /// Binding the write should leave behind. `None` when the kernel picks
    /// (probes, dynamic IDs) or the op addresses no function.
    pub fn intended(&self) -> Option<BindingState> {
        match self.op {
            PrivilegedOp::Unbind { .. } => Some(BindingState::Unbound),
            PrivilegedOp::Bind { driver, .. } => Some(BindingState::from_driver(Some(driver))),
            PrivilegedOp::SetDriverOverride { .. } => self.from.clone(),
            _ => None,
        }
    }

    /// Record the outcome of the attempt.
    pub fn emit<T>(&self, outcome: &crate::Result<T>) {
        let address = self.op.address().map(|a| a.to_string()).unwrap_or_default();
        let from = describe_state(self.from.as_ref());
        let to = describe_state(self.intended().as_ref());
        match outcome {
            Ok(_) => tracing::info!(
                target: EVENT_TARGET,
                event = "mutation",
                group = self.group,
                address = %address,
                op = self.op.label(),
                from = %from,
                to = %to,
                outcome = "ok",
                "{}",
                self.op
            ),
            Err(err) => tracing::warn!(
                target: EVENT_TARGET,
                event = "mutation",
                group = self.group,
                address = %address,
                op = self.op.label(),
                from = %from,
                to = %to,
                outcome = "error",
                error = %err,
                "{}",
                self.op
            ),
        }
    }
}

fn describe_state(state: Option<&BindingState>) -> String {
    state.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}

fn format_addresses(addresses: &[PciAddress]) -> String {
    addresses
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_for_consumers() {
        let event = SessionEvent {
            session_id: Uuid::nil(),
            vm_name: "win11".to_string(),
            group_id: Some(5),
            functions: vec!["0000:01:00.0".parse().unwrap(), "0000:01:00.1".parse().unwrap()],
            from: Phase::Binding,
            to: Phase::Failed("bind refused".to_string()),
            at: Utc::now(),
            detail: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["vm_name"], "win11");
        assert_eq!(json["group_id"], 5);
        assert_eq!(json["functions"][1], "0000:01:00.1");
        assert_eq!(json["to"]["Failed"], "bind refused");
        assert_eq!(format_addresses(&event.functions), "0000:01:00.0,0000:01:00.1");
    }

    #[test]
    fn test_mutation_states() {
        let address: PciAddress = "0000:01:00.0".parse().unwrap();
        let nvidia = crate::pci::DriverName::parse("nvidia").unwrap();

        let unbind = PrivilegedOp::Unbind {
            driver: nvidia.clone(),
            address,
        };
        let attempt = Mutation {
            group: 5,
            op: &unbind,
            from: Some(BindingState::HostDriver(nvidia.clone())),
        };
        assert_eq!(attempt.intended(), Some(BindingState::Unbound));
        assert_eq!(describe_state(attempt.from.as_ref()), "host driver nvidia");

        let bind = PrivilegedOp::Bind {
            driver: crate::pci::DriverName::vfio_pci(),
            address,
        };
        let attempt = Mutation {
            group: 5,
            op: &bind,
            from: Some(BindingState::Unbound),
        };
        assert_eq!(attempt.intended(), Some(BindingState::VfioPci));

        let probe = PrivilegedOp::ProbeDriver { address };
        let attempt = Mutation {
            group: 5,
            op: &probe,
            from: Some(BindingState::Unbound),
        };
        assert_eq!(describe_state(attempt.intended().as_ref()), "-");
    }
}
