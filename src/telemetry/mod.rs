//! Live event stream for external monitors.
//!
//! Messages are self-contained JSON objects `{type, cycle, timestamp, data}`.  Publication is
//! best effort: a sink never blocks the simulation and never reports failure to it.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};

mod publisher;

pub use publisher::TcpPublisher;

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    SimStart {
        sim_name: String,
        accel_name: String,
    },
    SimEnd {
        total_cycles: u64,
    },
    CycleUpdate,
    QueueState {
        read_depth: usize,
        write_depth: usize,
        compute_depth: usize,
    },
    FuState {
        fu_name: String,
        busy: bool,
        utilization: f64,
    },
    InstructionIssue {
        uid: u32,
        opcode: String,
        fu_type: String,
    },
    InstructionComplete {
        uid: u32,
    },
    Stall {
        uid: u32,
        reason: String,
    },
    StatsUpdate(Value),
    Heartbeat,
    MemoryAccess {
        address: u64,
        size: u64,
        is_write: bool,
        access_type: String,
    },
    FuActivity {
        fu_type: String,
        instance: u32,
        uid: u32,
        start_cycle: u64,
        end_cycle: u64,
    },
    DataflowNode {
        uid: u32,
        opcode: String,
        queue: u32,
        dependencies: Vec<u32>,
    },
    DataflowEdge {
        producer: u32,
        consumer: u32,
        critical: bool,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::SimStart { .. } => "sim_start",
            TelemetryEvent::SimEnd { .. } => "sim_end",
            TelemetryEvent::CycleUpdate => "cycle_update",
            TelemetryEvent::QueueState { .. } => "queue_state",
            TelemetryEvent::FuState { .. } => "fu_state",
            TelemetryEvent::InstructionIssue { .. } => "instruction_issue",
            TelemetryEvent::InstructionComplete { .. } => "instruction_complete",
            TelemetryEvent::Stall { .. } => "stall_event",
            TelemetryEvent::StatsUpdate(_) => "stats_update",
            TelemetryEvent::Heartbeat => "heartbeat",
            TelemetryEvent::MemoryAccess { .. } => "memory_access",
            TelemetryEvent::FuActivity { .. } => "fu_activity",
            TelemetryEvent::DataflowNode { .. } => "dataflow_node",
            TelemetryEvent::DataflowEdge { .. } => "dataflow_edge",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            TelemetryEvent::SimStart {
                sim_name,
                accel_name,
            } => json!({ "sim_name": sim_name, "accel_name": accel_name }),
            TelemetryEvent::SimEnd { total_cycles } => json!({ "total_cycles": total_cycles }),
            TelemetryEvent::CycleUpdate | TelemetryEvent::Heartbeat => json!({}),
            TelemetryEvent::QueueState {
                read_depth,
                write_depth,
                compute_depth,
            } => json!({
                "read_depth": read_depth,
                "write_depth": write_depth,
                "compute_depth": compute_depth,
            }),
            TelemetryEvent::FuState {
                fu_name,
                busy,
                utilization,
            } => json!({ "fu_name": fu_name, "busy": busy, "utilization": utilization }),
            TelemetryEvent::InstructionIssue {
                uid,
                opcode,
                fu_type,
            } => json!({ "uid": uid, "opcode": opcode, "fu_type": fu_type }),
            TelemetryEvent::InstructionComplete { uid } => json!({ "uid": uid }),
            TelemetryEvent::Stall { uid, reason } => json!({ "uid": uid, "reason": reason }),
            TelemetryEvent::StatsUpdate(report) => report.clone(),
            TelemetryEvent::MemoryAccess {
                address,
                size,
                is_write,
                access_type,
            } => json!({
                "address": address,
                "size": size,
                "is_write": is_write,
                "access_type": access_type,
            }),
            TelemetryEvent::FuActivity {
                fu_type,
                instance,
                uid,
                start_cycle,
                end_cycle,
            } => json!({
                "fu_type": fu_type,
                "instance": instance,
                "uid": uid,
                "start_cycle": start_cycle,
                "end_cycle": end_cycle,
            }),
            TelemetryEvent::DataflowNode {
                uid,
                opcode,
                queue,
                dependencies,
            } => json!({
                "uid": uid,
                "opcode": opcode,
                "queue": queue,
                "dependencies": dependencies,
            }),
            TelemetryEvent::DataflowEdge {
                producer,
                consumer,
                critical,
            } => json!({ "producer": producer, "consumer": consumer, "critical": critical }),
        }
    }
}

/// Wire envelope.  Field order is fixed by declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub cycle: u64,
    pub timestamp: f64,
    pub data: Value,
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl TelemetryMessage {
    /// Stamps with the wall clock; the stamp is informational and never read back.
    pub fn new(cycle: u64, event: &TelemetryEvent) -> Self {
        Self {
            kind: event.kind(),
            cycle,
            timestamp: unix_seconds(),
            data: event.data(),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub trait TelemetrySink {
    fn is_enabled(&self) -> bool;

    fn publish(&mut self, message: &TelemetryMessage);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn is_enabled(&self) -> bool {
        false
    }

    fn publish(&mut self, _message: &TelemetryMessage) {}
}

/// Keeps every message in a shared buffer the caller can inspect while the engine owns the sink.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    messages: Rc<RefCell<Vec<TelemetryMessage>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Rc<RefCell<Vec<TelemetryMessage>>> {
        Rc::clone(&self.messages)
    }
}

impl TelemetrySink for BufferSink {
    fn is_enabled(&self) -> bool {
        true
    }

    fn publish(&mut self, message: &TelemetryMessage) {
        self.messages.borrow_mut().push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_field_order() {
        let msg = TelemetryMessage::new(
            42,
            &TelemetryEvent::QueueState {
                read_depth: 1,
                write_depth: 2,
                compute_depth: 3,
            },
        );
        let line = msg.to_line();
        let type_at = line.find("\"type\"").expect("type");
        let cycle_at = line.find("\"cycle\"").expect("cycle");
        let ts_at = line.find("\"timestamp\"").expect("timestamp");
        let data_at = line.find("\"data\"").expect("data");
        assert!(type_at < cycle_at && cycle_at < ts_at && ts_at < data_at);

        let parsed: Value = serde_json::from_str(&line).expect("parse");
        assert_eq!("queue_state", parsed["type"]);
        assert_eq!(42, parsed["cycle"]);
        assert_eq!(3, parsed["data"]["compute_depth"]);
        assert!(parsed["timestamp"].as_f64().expect("float") > 0.0);
    }

    #[test]
    fn event_payloads() {
        let issue = TelemetryEvent::InstructionIssue {
            uid: 7,
            opcode: "fmul".to_string(),
            fu_type: "fp_float_muldiv".to_string(),
        };
        assert_eq!("instruction_issue", issue.kind());
        assert_eq!(json!({"uid": 7, "opcode": "fmul", "fu_type": "fp_float_muldiv"}), issue.data());

        assert_eq!(json!({}), TelemetryEvent::Heartbeat.data());
        assert_eq!("stall_event", TelemetryEvent::Stall { uid: 1, reason: "x".into() }.kind());

        let node = TelemetryEvent::DataflowNode {
            uid: 3,
            opcode: "add".to_string(),
            queue: 0,
            dependencies: vec![1, 2],
        };
        assert_eq!(json!([1, 2]), node.data()["dependencies"]);
    }

    #[test]
    fn buffer_sink_shares_messages() {
        let sink = BufferSink::new();
        let handle = sink.handle();
        let mut boxed: Box<dyn TelemetrySink> = Box::new(sink);
        boxed.publish(&TelemetryMessage::new(0, &TelemetryEvent::Heartbeat));
        assert_eq!(1, handle.borrow().len());
        assert_eq!("heartbeat", handle.borrow()[0].kind);
        assert!(!NullSink.is_enabled());
    }
}
