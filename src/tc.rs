//! Traffic-shaping command planning
//!
//! Shaping is applied by diffing the requested [`LinkModel`] against the
//! snapshot that was *previously applied* to the device (never against live
//! device state). The diff decides between three shapes of plan:
//!
//! - nothing changed: an empty plan (idempotent re-apply),
//! - a previously set property is now unset: the whole discipline tree must
//!   be deleted and rebuilt (`tc` cannot turn a property off incrementally),
//! - otherwise: `change` actions against the existing class/qdisc handles.
//!
//! Bandwidth is shaped as a classful htb discipline (root handle `5:0`,
//! class `5:1`); delay/jitter/loss ride a child netem discipline (handle
//! `10:`) parented under the bandwidth class, or at the root when no
//! bandwidth is set. `bit_error_rate` participates in the diff but maps to
//! no discipline.
//!
//! Planning is pure so the diff logic is testable without privileges; the
//! interface wrapper executes the planned commands through its namespace.

use crate::model::link_model::LinkModel;

/// One `tc` invocation (arguments only, without the `tc` binary).
pub type TcCommand = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Add,
    Change,
}

impl Action {
    fn verb(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
        }
    }
}

/// Whether any field set in `previous` has been cleared in `requested`.
fn reset_required(previous: &LinkModel, requested: &LinkModel) -> bool {
    (previous.bandwidth_bits_per_second.is_some() && requested.bandwidth_bits_per_second.is_none())
        || (previous.delay_ms.is_some() && requested.delay_ms.is_none())
        || (previous.jitter_ms.is_some() && requested.jitter_ms.is_none())
        || (previous.packet_loss_percent.is_some() && requested.packet_loss_percent.is_none())
        || (previous.bit_error_rate.is_some() && requested.bit_error_rate.is_none())
}

/// Plan the `tc` command sequence moving `device` from the previously
/// applied snapshot to `requested`. `tc_active` tells whether the device
/// currently carries any discipline (see
/// [`crate::wrapper::interface::InterfaceWrapper::is_tc_enabled`]).
pub fn plan(device: &str, previous: Option<&LinkModel>, requested: &LinkModel, tc_active: bool) -> Vec<TcCommand> {
    if previous == Some(requested) {
        return Vec::new();
    }

    let rebuild = match previous {
        Some(prev) => reset_required(prev, requested),
        None => true,
    };

    let mut commands: Vec<TcCommand> = Vec::new();
    let action = if rebuild {
        if tc_active {
            commands.push(args(&["qdisc", "del", "dev", device, "root"]));
        }
        Action::Add
    } else {
        Action::Change
    };

    let bandwidth = requested.bandwidth_bits_per_second;
    if let Some(bps) = bandwidth {
        if action == Action::Add {
            commands.push(args(&[
                "qdisc", "add", "dev", device, "root", "handle", "5:0", "htb", "default", "1",
            ]));
        }
        let rate_kbit = (bps / 1000).max(1);
        commands.push(args(&[
            "class",
            action.verb(),
            "dev",
            device,
            "parent",
            "5:0",
            "classid",
            "5:1",
            "htb",
            "rate",
            &format!("{rate_kbit}kbit"),
            "burst",
            "15k",
        ]));
    }

    let delay = requested.delay_ms;
    let jitter = requested.jitter_ms;
    let loss = requested.packet_loss_percent;
    if delay.is_some() || jitter.is_some() || loss.is_some() {
        let mut cmd = vec!["qdisc".to_string(), action.verb().to_string()];
        cmd.extend(args(&["dev", device]));
        if bandwidth.is_some() {
            cmd.extend(args(&["parent", "5:1"]));
        } else {
            cmd.push("root".to_string());
        }
        cmd.extend(args(&["handle", "10:", "netem"]));
        if delay.is_some() || jitter.is_some() {
            cmd.push("delay".to_string());
            cmd.push(format!("{}ms", delay.unwrap_or(0)));
            if let Some(j) = jitter {
                cmd.push(format!("{j}ms"));
            }
        }
        if let Some(pct) = loss {
            cmd.push("loss".to_string());
            cmd.push(format!("{pct}%"));
        }
        commands.push(cmd);
    }

    commands
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Whether `tc qdisc show` output indicates a configured discipline, as
/// opposed to the kernel defaults (`noqueue` / a pfifo_fast `priomap`).
pub fn qdisc_output_indicates_shaping(output: &str) -> bool {
    !output.contains("noqueue") && !output.contains("priomap")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(commands: &[TcCommand]) -> Vec<String> {
        commands.iter().map(|c| c.join(" ")).collect()
    }

    fn shaped() -> LinkModel {
        LinkModel {
            bandwidth_bits_per_second: Some(10_000_000),
            delay_ms: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn first_application_builds_full_tree() {
        let plan = plan("h1-i1", None, &shaped(), false);
        let lines = flatten(&plan);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "qdisc add dev h1-i1 root handle 5:0 htb default 1");
        assert_eq!(
            lines[1],
            "class add dev h1-i1 parent 5:0 classid 5:1 htb rate 10000kbit burst 15k"
        );
        assert_eq!(lines[2], "qdisc add dev h1-i1 parent 5:1 handle 10: netem delay 5ms");
    }

    #[test]
    fn identical_model_yields_empty_plan() {
        let model = shaped();
        assert!(plan("h1-i1", Some(&model), &model, true).is_empty());
    }

    #[test]
    fn value_change_uses_change_actions() {
        let previous = shaped();
        let mut requested = shaped();
        requested.delay_ms = Some(20);
        let lines = flatten(&plan("h1-i1", Some(&previous), &requested, true));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("class change"));
        assert!(lines[1].starts_with("qdisc change"));
        assert!(!lines.iter().any(|l| l.contains("del")));
    }

    #[test]
    fn clearing_a_property_forces_rebuild() {
        let previous = shaped();
        let requested = LinkModel {
            bandwidth_bits_per_second: Some(10_000_000),
            ..Default::default()
        };
        let lines = flatten(&plan("h1-i1", Some(&previous), &requested, true));
        assert_eq!(lines[0], "qdisc del dev h1-i1 root");
        // Rebuilt with bandwidth only, no netem child
        assert!(lines[1].contains("htb default 1"));
        assert!(lines[2].starts_with("class add"));
        assert!(!lines.iter().any(|l| l.contains("netem")));
    }

    #[test]
    fn netem_roots_without_bandwidth() {
        let requested = LinkModel {
            delay_ms: Some(5),
            jitter_ms: Some(2),
            packet_loss_percent: Some(0.5),
            ..Default::default()
        };
        let lines = flatten(&plan("h1-i1", None, &requested, false));
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "qdisc add dev h1-i1 root handle 10: netem delay 5ms 2ms loss 0.5%"
        );
    }

    #[test]
    fn jitter_without_delay_still_emits_base_delay() {
        let requested = LinkModel {
            jitter_ms: Some(3),
            ..Default::default()
        };
        let lines = flatten(&plan("h1-i1", None, &requested, false));
        assert!(lines[0].contains("delay 0ms 3ms"));
    }

    #[test]
    fn clearing_bit_error_rate_triggers_rebuild() {
        let previous = LinkModel {
            delay_ms: Some(5),
            bit_error_rate: Some(1e-6),
            ..Default::default()
        };
        let requested = LinkModel {
            delay_ms: Some(5),
            ..Default::default()
        };
        let lines = flatten(&plan("h1-i1", Some(&previous), &requested, true));
        assert_eq!(lines[0], "qdisc del dev h1-i1 root");
    }

    #[test]
    fn no_stale_delete_on_untouched_device() {
        // Device never carried a discipline: rebuild without the delete
        let lines = flatten(&plan("h1-i1", None, &shaped(), false));
        assert!(!lines[0].contains("del"));
    }

    #[test]
    fn shaping_detection_from_qdisc_output() {
        assert!(!qdisc_output_indicates_shaping("qdisc noqueue 0: root refcnt 2"));
        assert!(!qdisc_output_indicates_shaping(
            "qdisc pfifo_fast 0: root refcnt 2 bands 3 priomap 1 2 2 2"
        ));
        assert!(qdisc_output_indicates_shaping(
            "qdisc htb 5: root refcnt 2 r2q 10 default 0x1"
        ));
    }
}
