//! STUN binding messages used for ICE connectivity checks (RFC 5389, RFC 8445)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use thiserror::Error;
use webrtc::stun::attributes::{
    ATTR_FINGERPRINT, ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_PRIORITY, ATTR_USE_CANDIDATE,
    ATTR_USERNAME, AttrType,
};
use webrtc::stun::fingerprint::FINGERPRINT;
use webrtc::stun::integrity::MessageIntegrity;
use webrtc::stun::message::{
    BINDING_REQUEST, BINDING_SUCCESS, Getter, Message, Setter, is_message,
};
use webrtc::stun::agent::TransactionId;
use webrtc::stun::textattrs::TextAttribute;
use webrtc::stun::xoraddr::XorMappedAddress;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("not a STUN message")]
    NotStun,

    #[error("malformed STUN message: {0}")]
    Malformed(String),

    #[error("unsupported STUN message type")]
    Unsupported,

    #[error("message integrity check failed")]
    Unauthorized,

    #[error("username does not match local credentials")]
    UsernameMismatch,

    #[error("remote credentials not known yet")]
    NoRemoteCredentials,
}

impl From<webrtc::stun::Error> for StunError {
    fn from(err: webrtc::stun::Error) -> Self {
        StunError::Malformed(err.to_string())
    }
}

/// ICE username fragment and password of one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

/// ICE role claimed in a check, with the sender's tie-breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleAttribute {
    Controlling(u64),
    Controlled(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRequest {
    pub transaction_id: [u8; 12],
    pub priority: Option<u32>,
    pub use_candidate: bool,
    pub role: Option<RoleAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingResponse {
    pub transaction_id: [u8; 12],
    pub mapped_address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

/// Attribute written as raw bytes; covers the ICE attributes that have no
/// dedicated type in the STUN crate
struct RawAttribute {
    typ: AttrType,
    value: Vec<u8>,
}

impl Setter for RawAttribute {
    fn add_to(&self, m: &mut Message) -> Result<(), webrtc::stun::Error> {
        m.add(self.typ, &self.value);
        Ok(())
    }
}

/// Parse and authenticate a binding request or success response.
///
/// Requests must carry `local_ufrag:remote_ufrag` and are authenticated with
/// the local password. Responses are authenticated with the remote password.
pub fn decode(
    data: &[u8],
    local: &Credentials,
    remote: Option<&Credentials>,
) -> Result<StunMessage, StunError> {
    if !is_message(data) {
        return Err(StunError::NotStun);
    }
    let mut msg = Message::new();
    msg.unmarshal_binary(data)?;

    if msg.contains(ATTR_FINGERPRINT) {
        FINGERPRINT.check(&msg).map_err(|_| StunError::Unauthorized)?;
    }

    if msg.typ == BINDING_REQUEST {
        let username = TextAttribute::get_from_as(&msg, ATTR_USERNAME)
            .map_err(|_| StunError::UsernameMismatch)?;
        match username.text.split_once(':') {
            Some((ours, _theirs)) if ours == local.ufrag => {}
            _ => return Err(StunError::UsernameMismatch),
        }
        MessageIntegrity::new_short_term_integrity(local.pwd.clone())
            .check(&mut msg)
            .map_err(|_| StunError::Unauthorized)?;

        let priority = msg
            .get(ATTR_PRIORITY)
            .ok()
            .and_then(|v| <[u8; 4]>::try_from(v.as_slice()).ok())
            .map(u32::from_be_bytes);
        let tiebreaker = |typ| {
            msg.get(typ)
                .ok()
                .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
                .map(u64::from_be_bytes)
        };
        let role = tiebreaker(ATTR_ICE_CONTROLLING)
            .map(RoleAttribute::Controlling)
            .or_else(|| tiebreaker(ATTR_ICE_CONTROLLED).map(RoleAttribute::Controlled));

        return Ok(StunMessage::Request(BindingRequest {
            transaction_id: msg.transaction_id.0,
            priority,
            use_candidate: msg.contains(ATTR_USE_CANDIDATE),
            role,
        }));
    }

    if msg.typ == BINDING_SUCCESS {
        let remote = remote.ok_or(StunError::NoRemoteCredentials)?;
        MessageIntegrity::new_short_term_integrity(remote.pwd.clone())
            .check(&mut msg)
            .map_err(|_| StunError::Unauthorized)?;

        let mut mapped = XorMappedAddress {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        };
        let mapped_address = mapped
            .get_from(&msg)
            .ok()
            .map(|_| SocketAddr::new(mapped.ip, mapped.port));

        return Ok(StunMessage::Response(BindingResponse {
            transaction_id: msg.transaction_id.0,
            mapped_address,
        }));
    }

    Err(StunError::Unsupported)
}

/// Connectivity check sent to `remote`. Returns the transaction id and the
/// encoded message.
pub fn binding_request(
    local: &Credentials,
    remote: &Credentials,
    priority: u32,
    role: RoleAttribute,
    use_candidate: bool,
) -> Result<([u8; 12], Bytes), StunError> {
    let transaction_id = TransactionId::new();
    let (role_type, tiebreaker) = match role {
        RoleAttribute::Controlling(t) => (ATTR_ICE_CONTROLLING, t),
        RoleAttribute::Controlled(t) => (ATTR_ICE_CONTROLLED, t),
    };

    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(BINDING_REQUEST),
        Box::new(transaction_id),
        Box::new(TextAttribute::new(
            ATTR_USERNAME,
            format!("{}:{}", remote.ufrag, local.ufrag),
        )),
        Box::new(RawAttribute {
            typ: ATTR_PRIORITY,
            value: priority.to_be_bytes().to_vec(),
        }),
        Box::new(RawAttribute {
            typ: role_type,
            value: tiebreaker.to_be_bytes().to_vec(),
        }),
    ];
    if use_candidate {
        setters.push(Box::new(RawAttribute {
            typ: ATTR_USE_CANDIDATE,
            value: Vec::new(),
        }));
    }
    setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
        remote.pwd.clone(),
    )));
    setters.push(Box::new(FINGERPRINT));

    let mut msg = Message::new();
    msg.build(&setters)?;
    Ok((msg.transaction_id.0, Bytes::from(msg.raw)))
}

/// Success response telling the requester the address we saw it from
pub fn binding_success(
    transaction_id: [u8; 12],
    from: SocketAddr,
    local: &Credentials,
) -> Result<Bytes, StunError> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(BINDING_SUCCESS),
        Box::new(TransactionId(transaction_id)),
        Box::new(XorMappedAddress {
            ip: from.ip(),
            port: from.port(),
        }),
        Box::new(MessageIntegrity::new_short_term_integrity(local.pwd.clone())),
        Box::new(FINGERPRINT),
    ])?;
    Ok(Bytes::from(msg.raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(ufrag: &str, pwd: &str) -> Credentials {
        Credentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    #[test]
    fn request_is_authenticated_with_receiver_password() {
        let a = creds("aaaa", "a-password-long-enough-000");
        let b = creds("bbbb", "b-password-long-enough-000");

        let (tid, raw) = binding_request(&a, &b, 1234, RoleAttribute::Controlling(7), true).unwrap();
        let StunMessage::Request(request) = decode(&raw, &b, None).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.transaction_id, tid);
        assert_eq!(request.priority, Some(1234));
        assert!(request.use_candidate);
        assert_eq!(request.role, Some(RoleAttribute::Controlling(7)));

        // Wrong side: username starts with b's ufrag
        assert_eq!(decode(&raw, &a, None), Err(StunError::UsernameMismatch));
    }

    #[test]
    fn request_with_wrong_password_is_rejected() {
        let a = creds("aaaa", "a-password-long-enough-000");
        let b = creds("bbbb", "b-password-long-enough-000");
        let forged = creds("bbbb", "not-the-right-password-00");
        let (_, raw) = binding_request(&a, &forged, 1, RoleAttribute::Controlled(1), false).unwrap();
        assert_eq!(decode(&raw, &b, None), Err(StunError::Unauthorized));
    }

    #[test]
    fn response_carries_mapped_address() {
        let a = creds("aaaa", "a-password-long-enough-000");
        let b = creds("bbbb", "b-password-long-enough-000");
        let from: SocketAddr = "192.0.2.7:40000".parse().unwrap();
        let tid = [9u8; 12];

        let raw = binding_success(tid, from, &b).unwrap();
        assert_eq!(decode(&raw, &a, None), Err(StunError::NoRemoteCredentials));
        let StunMessage::Response(response) = decode(&raw, &a, Some(&b)).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.transaction_id, tid);
        assert_eq!(response.mapped_address, Some(from));
    }

    #[test]
    fn rejects_non_stun() {
        let local = creds("aaaa", "a-password-long-enough-000");
        assert_eq!(decode(&[0x80, 96, 0, 1], &local, None), Err(StunError::NotStun));
    }
}
