//! Line-oriented operator console.

use std::fmt::Write;

use swarm_core::node_name;

use crate::node::MeshNode;

pub const HELP: &str = "\
commands:
  status           node summary
  peers            peer directory
  state            shared state with versions
  set <key> <val>  write a value
  get <key>        read a value
  sync             broadcast full state
  telem            telemetry settings
  push             push telemetry now
  help             this text";

/// Run one console line against the node and return what to print.
///
/// Handlers registered with [`MeshNode::on_console_command`] are tried first.
pub fn execute(node: &mut MeshNode, line: &str) -> String {
    let line = line.trim();
    if line.is_empty() {
        return String::new();
    }
    if let Some(output) = node.run_console_handlers(line) {
        return output;
    }

    let mut out = String::new();
    match line {
        "status" => {
            let s = node.status();
            let _ = writeln!(out, "--- NODE STATUS ---");
            let _ = writeln!(out, "ID: {} ({})", s.id, s.name);
            let _ = writeln!(out, "Role: {}", s.role);
            let _ = writeln!(out, "Coordinator: {}", node_name(s.coordinator_id));
            let _ = writeln!(out, "Peers: {}", s.peer_count);
            let _ = writeln!(out, "States: {}", s.state_count);
            let _ = writeln!(out, "Uptime: {}s", s.uptime_secs);
            let _ = write!(out, "Decode errors: {}", s.stats.decode_errors);
        }
        "peers" => {
            let _ = write!(out, "--- PEERS ---");
            for p in node.peers() {
                let status = if p.alive { "OK" } else { "DEAD" };
                let _ = write!(out, "\n  {} [{}] {}", p.name, p.role, status);
            }
        }
        "state" => {
            let _ = write!(out, "--- SHARED STATE ---");
            for (key, e) in node.state().iter() {
                let _ = write!(
                    out,
                    "\n  {} = {} (v{} from {})",
                    key,
                    e.value,
                    e.version,
                    node_name(e.origin)
                );
            }
        }
        "sync" => {
            node.broadcast_full_state();
            out.push_str("[SYNC] Broadcast full state");
        }
        "telem" => {
            let s = node.status();
            let settings = node.settings();
            let _ = writeln!(out, "--- TELEMETRY STATUS ---");
            let _ = writeln!(out, "Enabled: {}", yes_no(s.telemetry_enabled));
            let _ = writeln!(out, "Gateway: {}", yes_no(s.gateway));
            if !s.gateway {
                let _ = writeln!(out, "Mode: Sending via mesh to gateway");
            }
            let _ = write!(
                out,
                "Interval: {} ms",
                settings.telemetry_interval.as_millis()
            );
        }
        "push" => {
            if node.push_telemetry() {
                out.push_str("[TELEM] Pushed");
            } else {
                out.push_str("[TELEM] Not pushed (disabled or no server)");
            }
        }
        "help" => out.push_str(HELP),
        _ => {
            if let Some(rest) = line.strip_prefix("set ") {
                match rest.trim_start().split_once(' ') {
                    Some((key, value)) if !key.is_empty() => {
                        node.set_state(key, value);
                        let _ = write!(out, "[SET] {key} = {value}");
                    }
                    _ => out.push_str("Usage: set <key> <value>"),
                }
            } else if let Some(key) = line.strip_prefix("get ") {
                let key = key.trim();
                let value = node.get_state(key, "(not set)");
                let _ = write!(out, "[GET] {key} = {value}");
            } else {
                let _ = write!(out, "unknown command '{line}', try 'help'");
            }
        }
    }
    out
}

fn yes_no(v: bool) -> &'static str {
    if v { "YES" } else { "NO" }
}
