// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    ipc::{
        next_message_id,
        Message,
    },
    jobmgr::GroupId,
    runtime::fail::Fail,
};
use ::serde::{
    Deserialize,
    Serialize,
};
use ::serde_json::Value;

//======================================================================================================================
// Constants
//======================================================================================================================

pub const PUSH_JOB_STARTED: &str = "job-started";
pub const PUSH_JOB_PAUSED: &str = "job-paused";
pub const PUSH_JOB_TERMINATED: &str = "job-terminated";
pub const PUSH_JOB_RULEHIT: &str = "job-rulehit";
pub const PUSH_JOB_REMOVED: &str = "job-removed";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Record every debugger request, response and notification travels in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groupid: Option<String>,
    #[serde(default)]
    pub msgid: u64,
    /// Message id of the request this answers. Zero for notifications.
    #[serde(default)]
    pub replyto: u64,
    #[serde(default)]
    pub payload: Value,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Envelope {
    pub fn new(kind: &str, groupid: Option<&GroupId>, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            groupid: groupid.map(|id| id.to_string()),
            msgid: next_message_id(),
            replyto: 0,
            payload,
        }
    }

    /// Answer to `request` of type `kind` for the same job.
    pub fn reply(request: &Envelope, kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            groupid: request.groupid.clone(),
            msgid: next_message_id(),
            replyto: request.msgid,
            payload,
        }
    }

    /// The job a request is about.
    pub fn group_id(&self) -> Result<GroupId, Fail> {
        match &self.groupid {
            Some(id) => id.parse::<GroupId>(),
            None => {
                let cause: String = format!("request {} needs a groupid", self.kind);
                warn!("group_id(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Fail> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Fail> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Wraps the envelope in an IPC message carrying the same id.
    pub fn to_message(&self) -> Result<Message, Fail> {
        let mut message: Message = Message::reply(self.replyto, self.encode()?);
        message.id = self.msgid;
        Ok(message)
    }

    /// Reads an envelope from an IPC message. A missing `msgid` is taken from the message.
    pub fn from_message(message: &Message) -> Result<Self, Fail> {
        let mut envelope: Envelope = Self::decode(&message.payload)?;
        if envelope.msgid == 0 {
            envelope.msgid = message.id;
        }
        Ok(envelope)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Envelope;
    use crate::{
        ipc::Message,
        jobmgr::GroupId,
    };
    use ::anyhow::Result;
    use ::serde_json::{
        json,
        Value,
    };

    #[test]
    fn test_wire_format() -> Result<()> {
        let id: GroupId = GroupId::random();
        let request: Envelope = Envelope::new("getjobstatus", Some(&id), Value::Null);
        let text: String = String::from_utf8(request.encode()?)?;
        crate::ensure_eq!(text.contains("\"type\":\"getjobstatus\""), true);
        crate::ensure_eq!(text.contains(&format!("\"groupid\":\"{}\"", id)), true);

        let response: Envelope = Envelope::reply(&request, "getjobstatus-ok", json!({"status": "running"}));
        crate::ensure_eq!(response.replyto, request.msgid);
        crate::ensure_eq!(response.group_id()?, id);
        Ok(())
    }

    #[test]
    fn test_missing_fields_default() -> Result<()> {
        let message: Message = Message {
            id: 42,
            ..Message::new(br#"{"type":"getjobmgrstatus"}"#.to_vec())
        };
        let envelope: Envelope = Envelope::from_message(&message)?;
        crate::ensure_eq!(envelope.kind, "getjobmgrstatus".to_string());
        crate::ensure_eq!(envelope.msgid, 42);
        crate::ensure_eq!(envelope.replyto, 0);
        crate::ensure_eq!(envelope.payload, Value::Null);
        crate::ensure_eq!(envelope.group_id().map_err(|e| e.errno), Err(libc::EINVAL));
        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() -> Result<()> {
        crate::ensure_eq!(Envelope::decode(b"{not json").is_err(), true);
        Ok(())
    }
}
