use crate::envelope::Operation;

pub const TOPIC_DIRECT_METHODS: &str = "$iothub/methods/POST/#";
const DIRECT_METHOD_PREFIX: &str = "$iothub/methods/POST/";

pub fn device_bound_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub fn direct_method_reply_topic(status: u16, rid: u64) -> String {
    format!("$iothub/methods/res/{status}/?$rid={rid}")
}

/// RESPONSE maps to 200, anything else to 500.
pub fn direct_method_status(op: Operation) -> u16 {
    match op {
        Operation::Response => 200,
        _ => 500,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// Raw envelope bytes, fire-and-forget.
    DeviceBound,
    /// JSON byte array; the reply goes to the topic built from `rid`.
    DirectMethod { method: String, rid: u64 },
}

/// Classifies a publish received on one of the subscribed filters.
pub fn classify(topic: &str, device_id: &str) -> Option<InboundTopic> {
    let device_bound = format!("devices/{device_id}/messages/devicebound/");
    if topic.starts_with(&device_bound) {
        return Some(InboundTopic::DeviceBound);
    }

    let rest = topic.strip_prefix(DIRECT_METHOD_PREFIX)?;
    let (method, query) = rest.split_once("/?").or_else(|| rest.split_once('?'))?;
    Some(InboundTopic::DirectMethod {
        method: method.to_string(),
        rid: query_rid(query)?,
    })
}

fn query_rid(query: &str) -> Option<u64> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "$rid")
        .and_then(|(_, value)| value.parse().ok())
}
