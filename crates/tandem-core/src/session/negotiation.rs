//! Negotiation status and key pool status of a session

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a session is in the rekey protocol.
///
/// Ordered: everything at or after `Confirmed` counts as confirmed.
///
/// ```text
/// Unconfirmed <--> Sending --> Sent --> Confirmed <--> NewSessionTriggered --> NewSessionCreated
///                    |                    ^
///                    +--------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Negotiation {
    /// Created by a rekey, the partner has not confirmed it
    Unconfirmed,
    /// The rekey trigger for this session is being sent
    Sending,
    /// The rekey trigger went out, waiting for the confirm
    Sent,
    /// Both partners hold the session
    Confirmed,
    /// Key usage crossed the threshold, a successor is being created
    NewSessionTriggered,
    /// A successor session exists
    NewSessionCreated,
}

impl Negotiation {
    /// Every status, in order.
    pub const ALL: [Self; 6] = [
        Self::Unconfirmed,
        Self::Sending,
        Self::Sent,
        Self::Confirmed,
        Self::NewSessionTriggered,
        Self::NewSessionCreated,
    ];

    /// True if `self -> to` is in the transition table.
    ///
    /// `Sending -> Confirmed` covers a confirm that lands before the
    /// trigger's round results do.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Unconfirmed, Self::Sending)
                | (Self::Sending, Self::Unconfirmed | Self::Sent | Self::Confirmed)
                | (Self::Sent, Self::Confirmed)
                | (Self::Confirmed, Self::NewSessionTriggered)
                | (Self::NewSessionTriggered, Self::Confirmed | Self::NewSessionCreated)
        )
    }

    /// Status written to disk. In-flight statuses fall back to their stable
    /// predecessor so the action is retried after a reload.
    pub fn persisted(self) -> Self {
        match self {
            Self::Sending => Self::Unconfirmed,
            Self::NewSessionTriggered => Self::Confirmed,
            other => other,
        }
    }

    /// True for `Confirmed` and later.
    pub fn is_confirmed(self) -> bool {
        self >= Self::Confirmed
    }
}

impl fmt::Display for Negotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconfirmed => "Unconfirmed",
            Self::Sending => "Sending",
            Self::Sent => "Sent",
            Self::Confirmed => "Confirmed",
            Self::NewSessionTriggered => "NewSessionTriggered",
            Self::NewSessionCreated => "NewSessionCreated",
        })
    }
}

/// Key pool status, derived from usage counts alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Keys available, no rekey due
    Active,
    /// Keys available, usage crossed the rekey threshold
    RekeyNeeded,
    /// Only rekey-reserved keys remain
    Empty,
    /// No keys at all remain
    RekeyEmpty,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "Active",
            Self::RekeyNeeded => "Rekey Needed",
            Self::Empty => "Empty",
            Self::RekeyEmpty => "Rekey Empty",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use Negotiation::{
            Confirmed, NewSessionCreated, NewSessionTriggered, Sending, Sent, Unconfirmed,
        };
        let legal = [
            (Unconfirmed, Sending),
            (Sending, Unconfirmed),
            (Sending, Sent),
            (Sending, Confirmed),
            (Sent, Confirmed),
            (Confirmed, NewSessionTriggered),
            (NewSessionTriggered, Confirmed),
            (NewSessionTriggered, NewSessionCreated),
        ];

        for from in Negotiation::ALL {
            for to in Negotiation::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn in_flight_statuses_are_not_persisted() {
        assert_eq!(Negotiation::Sending.persisted(), Negotiation::Unconfirmed);
        assert_eq!(Negotiation::NewSessionTriggered.persisted(), Negotiation::Confirmed);
        for stable in [
            Negotiation::Unconfirmed,
            Negotiation::Sent,
            Negotiation::Confirmed,
            Negotiation::NewSessionCreated,
        ] {
            assert_eq!(stable.persisted(), stable);
        }
    }

    #[test]
    fn confirmed_is_ordered() {
        assert!(!Negotiation::Sent.is_confirmed());
        assert!(Negotiation::Confirmed.is_confirmed());
        assert!(Negotiation::NewSessionCreated.is_confirmed());
        assert!(Negotiation::Unconfirmed < Negotiation::NewSessionTriggered);
    }
}
