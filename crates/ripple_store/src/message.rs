//! Protocol message schema.
//!
//! The wire format is a single flat envelope of optional fields; internally
//! messages are a tagged union. The conversion happens once at the transport
//! boundary so the rest of the node only ever sees [`Message`] values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ripple_ir::record::RecordEntry;
use ripple_ir::types::{OpMode, Operation, ReplicaId, ViewId};

/// Role a peer claims in its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloKind {
    #[serde(rename = "CLIENT")]
    Client,
    #[serde(rename = "SERVER")]
    Server,
}

/// First frame on a new connection: identifies the sender and its view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "type")]
    pub kind: HelloKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: ReplicaId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ReplicaId>,
    #[serde(rename = "viewID", default)]
    pub view_id: ViewId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leader: ReplicaId,
}

/// Reply to a hello: the responder's current view snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(rename = "viewID", default)]
    pub view_id: ViewId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ReplicaId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leader: ReplicaId,
}

/// A transactional operation proposed (and later finalized) by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub mode: OpMode,
    #[serde(rename = "clientID", default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(rename = "transactionID", default)]
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propose: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<Operation>,
}

/// A replica's reply to an operation request, stamped with its view.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(rename = "viewID", default)]
    pub view_id: ViewId,
    #[serde(rename = "readValues", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read_values: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewChangeRequest {
    #[serde(rename = "viewID")]
    pub view_id: ViewId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ReplicaId>,
}

/// Reply to a view-change request. Carries the responder's record so the new
/// leader can merge it into the master record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewChangeResponse {
    #[serde(rename = "viewID")]
    pub view_id: ViewId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ReplicaId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub record: BTreeMap<String, RecordEntry>,
}

/// Leader-to-replica synchronization payload that completes a view change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    #[serde(rename = "viewID")]
    pub view_id: ViewId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leader: ReplicaId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ReplicaId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entries: BTreeMap<String, RecordEntry>,
}

/// The flat wire envelope. Exactly one payload field is set per frame;
/// unknown fields are ignored on decode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub ping: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub pong: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hello: Option<Hello>,
    #[serde(rename = "helloResponse", skip_serializing_if = "Option::is_none")]
    pub hello_response: Option<HelloResponse>,
    #[serde(rename = "operationRequest", skip_serializing_if = "Option::is_none")]
    pub operation_request: Option<OperationRequest>,
    #[serde(rename = "operationResponse", skip_serializing_if = "Option::is_none")]
    pub operation_response: Option<OperationResponse>,
    #[serde(rename = "viewChangeRequest", skip_serializing_if = "Option::is_none")]
    pub view_change_request: Option<ViewChangeRequest>,
    #[serde(rename = "viewChangeResponse", skip_serializing_if = "Option::is_none")]
    pub view_change_response: Option<ViewChangeResponse>,
    #[serde(rename = "masterRecord", skip_serializing_if = "Option::is_none")]
    pub master_record: Option<MasterRecord>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Internal tagged form of the envelope payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Ping(u32),
    Pong(u32),
    Hello(Hello),
    HelloResponse(HelloResponse),
    OperationRequest(OperationRequest),
    OperationResponse(OperationResponse),
    ViewChangeRequest(ViewChangeRequest),
    ViewChangeResponse(ViewChangeResponse),
    MasterRecord(MasterRecord),
}

impl Envelope {
    pub fn new(request_id: Option<String>, message: Message) -> Self {
        let mut envelope = Envelope {
            request_id,
            ..Envelope::default()
        };
        match message {
            Message::Ping(n) => envelope.ping = n,
            Message::Pong(n) => envelope.pong = n,
            Message::Hello(hello) => envelope.hello = Some(hello),
            Message::HelloResponse(resp) => envelope.hello_response = Some(resp),
            Message::OperationRequest(req) => envelope.operation_request = Some(req),
            Message::OperationResponse(resp) => envelope.operation_response = Some(resp),
            Message::ViewChangeRequest(req) => envelope.view_change_request = Some(req),
            Message::ViewChangeResponse(resp) => envelope.view_change_response = Some(resp),
            Message::MasterRecord(record) => envelope.master_record = Some(record),
        }
        envelope
    }

    /// Split the envelope into its request id and payload. Empty or unknown
    /// envelopes yield `None`; the caller logs and drops them.
    pub fn split(self) -> (Option<String>, Option<Message>) {
        let request_id = self.request_id;
        let message = if self.ping != 0 {
            Some(Message::Ping(self.ping))
        } else if self.pong != 0 {
            Some(Message::Pong(self.pong))
        } else if let Some(hello) = self.hello {
            Some(Message::Hello(hello))
        } else if let Some(resp) = self.hello_response {
            Some(Message::HelloResponse(resp))
        } else if let Some(req) = self.operation_request {
            Some(Message::OperationRequest(req))
        } else if let Some(resp) = self.operation_response {
            Some(Message::OperationResponse(resp))
        } else if let Some(req) = self.view_change_request {
            Some(Message::ViewChangeRequest(req))
        } else if let Some(resp) = self.view_change_response {
            Some(Message::ViewChangeResponse(resp))
        } else if let Some(record) = self.master_record {
            Some(Message::MasterRecord(record))
        } else {
            None
        };
        (request_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_ir::types::CasWrite;

    fn round_trip(message: Message) {
        let envelope = Envelope::new(Some("req-1".into()), message.clone());
        let json = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&json).unwrap();
        let (request_id, payload) = decoded.split();
        assert_eq!(request_id.as_deref(), Some("req-1"));
        assert_eq!(payload, Some(message));
    }

    #[test]
    fn every_message_kind_round_trips() {
        round_trip(Message::Ping(1));
        round_trip(Message::Pong(1));
        round_trip(Message::Hello(Hello {
            kind: HelloKind::Server,
            id: "127.0.0.1:7001".into(),
            members: vec!["127.0.0.1:7001".into(), "127.0.0.1:7002".into()],
            view_id: 3,
            leader: "127.0.0.1:7001".into(),
        }));
        round_trip(Message::HelloResponse(HelloResponse {
            view_id: 3,
            members: vec!["127.0.0.1:7001".into()],
            leader: String::new(),
        }));
        round_trip(Message::OperationRequest(OperationRequest {
            mode: OpMode::Inconsistent,
            client_id: "client-1".into(),
            transaction_id: "txn-1".into(),
            propose: Some(Operation {
                read_set: vec!["a".into()],
                write_set: BTreeMap::from([("b".to_string(), "2".to_string())]),
                write_cset: BTreeMap::from([(
                    "a".to_string(),
                    CasWrite {
                        previous: String::new(),
                        proposed: "1".into(),
                    },
                )]),
            }),
            finalize: None,
        }));
        round_trip(Message::OperationResponse(OperationResponse {
            success: true,
            view_id: 4,
            read_values: BTreeMap::from([("a".to_string(), "1".to_string())]),
        }));
        round_trip(Message::ViewChangeRequest(ViewChangeRequest {
            view_id: 5,
            members: vec!["127.0.0.1:7001".into()],
        }));
        round_trip(Message::ViewChangeResponse(ViewChangeResponse {
            view_id: 5,
            members: vec!["127.0.0.1:7001".into()],
            record: BTreeMap::new(),
        }));
        round_trip(Message::MasterRecord(MasterRecord {
            view_id: 5,
            leader: "127.0.0.1:7001".into(),
            members: vec!["127.0.0.1:7001".into()],
            entries: BTreeMap::new(),
        }));
    }

    #[test]
    fn hello_kind_uses_wire_labels() {
        let hello = Hello {
            kind: HelloKind::Client,
            id: String::new(),
            members: Vec::new(),
            view_id: 0,
            leader: String::new(),
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"type\":\"CLIENT\""));
    }

    #[test]
    fn operation_mode_travels_as_an_integer() {
        let envelope = Envelope::new(
            None,
            Message::OperationRequest(OperationRequest {
                mode: OpMode::Consensus,
                client_id: String::new(),
                transaction_id: "t".into(),
                propose: None,
                finalize: None,
            }),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"mode\":1"));
    }

    #[test]
    fn empty_and_unknown_envelopes_split_to_none() {
        let (request_id, payload) = Envelope::default().split();
        assert!(request_id.is_none());
        assert!(payload.is_none());

        // Unknown fields are tolerated; an envelope carrying only unknown
        // fields decodes but has no payload.
        let decoded: Envelope =
            serde_json::from_str(r#"{"requestID":"r","futureField":{"x":1}}"#).unwrap();
        let (request_id, payload) = decoded.split();
        assert_eq!(request_id.as_deref(), Some("r"));
        assert!(payload.is_none());
    }

    #[test]
    fn zero_ping_is_omitted_from_the_wire() {
        let envelope = Envelope::new(None, Message::Hello(Hello {
            kind: HelloKind::Client,
            id: String::new(),
            members: Vec::new(),
            view_id: 0,
            leader: String::new(),
        }));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("\"ping\""));
        assert!(!json.contains("\"pong\""));
    }
}
