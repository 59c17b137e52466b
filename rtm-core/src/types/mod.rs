//! The PDU envelope and the typed bodies the client cares about.

mod pdu;

pub use pdu::{
    actions, ErrorBody, Pdu, PublishOkBody, ReadOkBody, SearchDataBody, SubscribeOkBody,
    SubscriptionData, WriteOkBody,
};
