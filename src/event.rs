//! Typed domain events projected from raw manager frames.

use crate::action::Fields;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// An unsolicited inbound frame, as delivered by a connection's read loop.
///
/// Not correlated to any action. Consumed when projected into a
/// [`DomainEvent`]; nothing of the raw frame is retained past dispatch.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// The `Event` field value (e.g. `Hangup`, `QueueMemberAdded`).
    pub name: String,
    /// Remaining frame fields in wire order.
    pub fields: Fields,
    /// When the frame was read off the socket.
    pub received_at: SystemTime,
}

impl RawEvent {
    /// Build a raw event from a frame's field list. The `Event` field is
    /// lifted out as the name.
    pub fn from_fields(fields: Fields) -> Self {
        let name = fields.get("Event").unwrap_or_default().to_string();
        Self {
            name,
            fields,
            received_at: SystemTime::now(),
        }
    }
}

/// Closed set of event categories this client understands.
///
/// Anything else classifies as [`Other`](EventCategory::Other) and still
/// produces a generic [`DomainEvent`] - no event is silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventCategory {
    /// A dial attempt started (`DialBegin`).
    DialBegin,
    /// A dial attempt finished (`DialEnd`).
    DialEnd,
    /// A channel hung up (`Hangup`).
    Hangup,
    /// A channel entered a bridge (`BridgeEnter`).
    BridgeEnter,
    /// A channel left a bridge (`BridgeLeave`).
    BridgeLeave,
    /// A member was added to a queue (`QueueMemberAdded`).
    QueueMemberAdded,
    /// A member was removed from a queue (`QueueMemberRemoved`).
    QueueMemberRemoved,
    /// A queue member's pause state changed (`QueueMemberPause`).
    QueueMemberPaused,
    /// A new channel was created (`Newchannel`).
    NewChannel,
    /// Unrecognized event name.
    Other,
}

impl EventCategory {
    /// Classify a wire event name (case-insensitive).
    pub fn classify(name: &str) -> Self {
        if name.eq_ignore_ascii_case("DialBegin") {
            EventCategory::DialBegin
        } else if name.eq_ignore_ascii_case("DialEnd") {
            EventCategory::DialEnd
        } else if name.eq_ignore_ascii_case("Hangup") {
            EventCategory::Hangup
        } else if name.eq_ignore_ascii_case("BridgeEnter") {
            EventCategory::BridgeEnter
        } else if name.eq_ignore_ascii_case("BridgeLeave") {
            EventCategory::BridgeLeave
        } else if name.eq_ignore_ascii_case("QueueMemberAdded") {
            EventCategory::QueueMemberAdded
        } else if name.eq_ignore_ascii_case("QueueMemberRemoved") {
            EventCategory::QueueMemberRemoved
        } else if name.eq_ignore_ascii_case("QueueMemberPause") {
            EventCategory::QueueMemberPaused
        } else if name.eq_ignore_ascii_case("Newchannel") {
            EventCategory::NewChannel
        } else {
            EventCategory::Other
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventCategory::DialBegin => "DialBegin",
            EventCategory::DialEnd => "DialEnd",
            EventCategory::Hangup => "Hangup",
            EventCategory::BridgeEnter => "BridgeEnter",
            EventCategory::BridgeLeave => "BridgeLeave",
            EventCategory::QueueMemberAdded => "QueueMemberAdded",
            EventCategory::QueueMemberRemoved => "QueueMemberRemoved",
            EventCategory::QueueMemberPaused => "QueueMemberPause",
            EventCategory::NewChannel => "Newchannel",
            EventCategory::Other => "Other",
        };
        f.write_str(name)
    }
}

/// Resolve a Q.850 hangup cause code to descriptive text.
///
/// Unknown codes fall back to `"Unknown cause <code>"`.
pub fn hangup_cause_text(code: u16) -> String {
    let text = match code {
        1 => "Unallocated number",
        2 => "No route to network",
        3 => "No route to destination",
        16 => "Normal call clearing",
        17 => "User busy",
        18 => "No user responding",
        19 => "No answer from user",
        20 => "Subscriber absent",
        21 => "Call rejected",
        22 => "Number changed",
        27 => "Destination out of order",
        28 => "Invalid number format",
        34 => "No circuit/channel available",
        38 => "Network out of order",
        41 => "Temporary failure",
        42 => "Switching equipment congestion",
        _ => return format!("Unknown cause {}", code),
    };
    text.to_string()
}

/// Queue member availability derived from device state and pause flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MemberAvailability {
    /// Idle and ready to take calls.
    Available,
    /// In use, ringing, busy, or on hold.
    Busy,
    /// Manually paused; overrides the device state.
    Paused,
    /// Device state unknown, invalid, or unavailable.
    Unknown,
}

impl MemberAvailability {
    /// Derive availability from the AMI `Status` device-state code and the
    /// `Paused` flag. Paused wins over any device state.
    pub fn derive(status_code: u8, paused: bool) -> Self {
        if paused {
            return MemberAvailability::Paused;
        }
        match status_code {
            1 => MemberAvailability::Available,
            2 | 3 | 6 | 7 | 8 => MemberAvailability::Busy,
            _ => MemberAvailability::Unknown,
        }
    }
}

/// Payload for [`DomainEvent::DialBegin`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialBeginEvent {
    /// Originating channel.
    pub channel: Option<String>,
    /// Channel being dialed.
    pub dest_channel: Option<String>,
    /// Dialed extension.
    pub dial_string: Option<String>,
    /// Caller id number on the originating leg.
    pub caller_id_num: Option<String>,
    /// Unique id of the originating channel.
    pub unique_id: Option<String>,
}

/// Payload for [`DomainEvent::DialEnd`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialEndEvent {
    /// Originating channel.
    pub channel: Option<String>,
    /// Channel that was dialed.
    pub dest_channel: Option<String>,
    /// Outcome (`ANSWER`, `BUSY`, `NOANSWER`, `CANCEL`, `CONGESTION`, …).
    pub dial_status: Option<String>,
    /// Unique id of the originating channel.
    pub unique_id: Option<String>,
}

impl DialEndEvent {
    /// `true` if the dialed party answered.
    pub fn was_answered(&self) -> bool {
        self.dial_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("ANSWER"))
    }
}

/// Payload for [`DomainEvent::Hangup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangupEvent {
    /// Channel that hung up.
    pub channel: Option<String>,
    /// Unique id of the channel.
    pub unique_id: Option<String>,
    /// Caller id number.
    pub caller_id_num: Option<String>,
    /// Q.850 cause code from the `Cause` field.
    pub cause_code: Option<u16>,
    /// Cause resolved to descriptive text.
    pub cause_text: String,
}

impl HangupEvent {
    /// `true` for cause 17 (user busy).
    pub fn was_busy(&self) -> bool {
        self.cause_code == Some(17)
    }

    /// `true` for cause 16 (normal call clearing).
    pub fn was_normal(&self) -> bool {
        self.cause_code == Some(16)
    }

    /// `true` for cause 19 (no answer from user).
    pub fn was_no_answer(&self) -> bool {
        self.cause_code == Some(19)
    }

    /// `true` for cause 21 (call rejected).
    pub fn was_rejected(&self) -> bool {
        self.cause_code == Some(21)
    }
}

/// Payload for [`DomainEvent::BridgeEnter`] and [`DomainEvent::BridgeLeave`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Unique id of the bridge.
    pub bridge_unique_id: Option<String>,
    /// Channel entering or leaving.
    pub channel: Option<String>,
    /// Unique id of the channel.
    pub unique_id: Option<String>,
    /// Number of channels now in the bridge.
    pub num_channels: Option<u32>,
}

/// Payload for the queue member lifecycle variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMemberEvent {
    /// Queue name.
    pub queue: Option<String>,
    /// Member interface (e.g. `PJSIP/agent1`).
    pub interface: Option<String>,
    /// Display name of the member.
    pub member_name: Option<String>,
    /// Raw device-state code from the `Status` field.
    pub status_code: Option<u8>,
    /// Whether the member is paused.
    pub paused: bool,
    /// Availability derived from status code and pause flag.
    pub availability: MemberAvailability,
}

/// Payload for [`DomainEvent::NewChannel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChannelEvent {
    /// Channel name.
    pub channel: Option<String>,
    /// Unique id of the channel.
    pub unique_id: Option<String>,
    /// Caller id number.
    pub caller_id_num: Option<String>,
    /// Dialplan extension.
    pub exten: Option<String>,
    /// Dialplan context.
    pub context: Option<String>,
}

/// Payload for [`DomainEvent::Generic`]: the raw fields, untyped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericEvent {
    /// Wire event name.
    pub name: String,
    /// Raw frame fields in wire order.
    pub fields: Fields,
}

/// A typed projection of one [`RawEvent`].
///
/// Tagged variant per category so handling can be checked for
/// exhaustiveness. Constructed once per raw event, immutable, handed to
/// listeners, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DomainEvent {
    /// Dial attempt started.
    DialBegin(DialBeginEvent),
    /// Dial attempt finished.
    DialEnd(DialEndEvent),
    /// Channel hung up.
    Hangup(HangupEvent),
    /// Channel entered a bridge.
    BridgeEnter(BridgeEvent),
    /// Channel left a bridge.
    BridgeLeave(BridgeEvent),
    /// Member added to a queue.
    QueueMemberAdded(QueueMemberEvent),
    /// Member removed from a queue.
    QueueMemberRemoved(QueueMemberEvent),
    /// Queue member pause state changed.
    QueueMemberPaused(QueueMemberEvent),
    /// New channel created.
    NewChannel(NewChannelEvent),
    /// Unrecognized event, raw fields preserved.
    Generic(GenericEvent),
}

impl DomainEvent {
    /// Project a raw frame into its typed form, consuming it.
    pub fn from_raw(raw: RawEvent) -> Self {
        let category = EventCategory::classify(&raw.name);
        let f = &raw.fields;

        let opt = |key: &str| f.get(key).map(|s| s.to_string());

        match category {
            EventCategory::DialBegin => DomainEvent::DialBegin(DialBeginEvent {
                channel: opt("Channel"),
                dest_channel: opt("DestChannel"),
                dial_string: opt("DialString"),
                caller_id_num: opt("CallerIDNum"),
                unique_id: opt("Uniqueid"),
            }),
            EventCategory::DialEnd => DomainEvent::DialEnd(DialEndEvent {
                channel: opt("Channel"),
                dest_channel: opt("DestChannel"),
                dial_status: opt("DialStatus"),
                unique_id: opt("Uniqueid"),
            }),
            EventCategory::Hangup => {
                let cause_code = f.get("Cause").and_then(|v| v.parse::<u16>().ok());
                let cause_text = match cause_code {
                    Some(code) => hangup_cause_text(code),
                    None => f
                        .get("Cause-txt")
                        .unwrap_or("Unknown cause")
                        .to_string(),
                };
                DomainEvent::Hangup(HangupEvent {
                    channel: opt("Channel"),
                    unique_id: opt("Uniqueid"),
                    caller_id_num: opt("CallerIDNum"),
                    cause_code,
                    cause_text,
                })
            }
            EventCategory::BridgeEnter | EventCategory::BridgeLeave => {
                let payload = BridgeEvent {
                    bridge_unique_id: opt("BridgeUniqueid"),
                    channel: opt("Channel"),
                    unique_id: opt("Uniqueid"),
                    num_channels: f
                        .get("BridgeNumChannels")
                        .and_then(|v| v.parse().ok()),
                };
                if category == EventCategory::BridgeEnter {
                    DomainEvent::BridgeEnter(payload)
                } else {
                    DomainEvent::BridgeLeave(payload)
                }
            }
            EventCategory::QueueMemberAdded
            | EventCategory::QueueMemberRemoved
            | EventCategory::QueueMemberPaused => {
                let status_code = f.get("Status").and_then(|v| v.parse::<u8>().ok());
                let paused = f
                    .get("Paused")
                    .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
                let payload = QueueMemberEvent {
                    queue: opt("Queue"),
                    interface: opt("Interface"),
                    member_name: opt("MemberName"),
                    status_code,
                    paused,
                    availability: MemberAvailability::derive(status_code.unwrap_or(0), paused),
                };
                match category {
                    EventCategory::QueueMemberAdded => DomainEvent::QueueMemberAdded(payload),
                    EventCategory::QueueMemberRemoved => DomainEvent::QueueMemberRemoved(payload),
                    _ => DomainEvent::QueueMemberPaused(payload),
                }
            }
            EventCategory::NewChannel => DomainEvent::NewChannel(NewChannelEvent {
                channel: opt("Channel"),
                unique_id: opt("Uniqueid"),
                caller_id_num: opt("CallerIDNum"),
                exten: opt("Exten"),
                context: opt("Context"),
            }),
            EventCategory::Other => DomainEvent::Generic(GenericEvent {
                name: raw.name,
                fields: raw.fields,
            }),
        }
    }

    /// The category this event belongs to.
    pub fn category(&self) -> EventCategory {
        match self {
            DomainEvent::DialBegin(_) => EventCategory::DialBegin,
            DomainEvent::DialEnd(_) => EventCategory::DialEnd,
            DomainEvent::Hangup(_) => EventCategory::Hangup,
            DomainEvent::BridgeEnter(_) => EventCategory::BridgeEnter,
            DomainEvent::BridgeLeave(_) => EventCategory::BridgeLeave,
            DomainEvent::QueueMemberAdded(_) => EventCategory::QueueMemberAdded,
            DomainEvent::QueueMemberRemoved(_) => EventCategory::QueueMemberRemoved,
            DomainEvent::QueueMemberPaused(_) => EventCategory::QueueMemberPaused,
            DomainEvent::NewChannel(_) => EventCategory::NewChannel,
            DomainEvent::Generic(_) => EventCategory::Other,
        }
    }
}
