//! Rekey trigger and confirm drivers

use std::sync::Arc;

use tandem_core::{Manager, Negotiation, PartnerId, Ratchet, RatchetError, Session};
use tandem_crypto::Suite;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    error::RekeyError,
    messages::{ReceivedMessage, RekeyConfirm, RekeyTrigger},
    params::RekeyParams,
    transport::{E2eSender, EventReporter, GarbledMessages, RoundTracker, SendParams},
};

/// Priority of negotiation failure events
const NEGOTIATION_FAILED_PRIORITY: u8 = 1;

/// Priority of fatal local faults hit while rekeying
const FATAL_PRIORITY: u8 = 0;

/// Drives both sides of the rekey protocol for one ratchet.
///
/// Cheap to clone; every clone shares the same collaborators.
pub struct Rekey<S: Suite> {
    ratchet: Arc<Ratchet<S>>,
    sender: Arc<dyn E2eSender>,
    rounds: Arc<dyn RoundTracker>,
    garbled: Arc<dyn GarbledMessages>,
    reporter: Arc<dyn EventReporter>,
    params: RekeyParams,
}

impl<S: Suite> Clone for Rekey<S> {
    fn clone(&self) -> Self {
        Self {
            ratchet: Arc::clone(&self.ratchet),
            sender: Arc::clone(&self.sender),
            rounds: Arc::clone(&self.rounds),
            garbled: Arc::clone(&self.garbled),
            reporter: Arc::clone(&self.reporter),
            params: self.params,
        }
    }
}

impl<S: Suite> Rekey<S> {
    /// Create a driver.
    pub fn new(
        ratchet: Arc<Ratchet<S>>,
        sender: Arc<dyn E2eSender>,
        rounds: Arc<dyn RoundTracker>,
        garbled: Arc<dyn GarbledMessages>,
        reporter: Arc<dyn EventReporter>,
        params: RekeyParams,
    ) -> Self {
        Self { ratchet, sender, rounds, garbled, reporter, params }
    }

    /// Ratchet this driver works on.
    pub fn ratchet(&self) -> &Arc<Ratchet<S>> {
        &self.ratchet
    }

    /// Protocol parameters.
    pub fn params(&self) -> &RekeyParams {
        &self.params
    }

    /// Start a negotiation for every send session of `manager` that needs
    /// one. Each runs in its own task.
    pub fn check_key_exchanges(&self, manager: &Arc<Manager<S>>) -> Vec<JoinHandle<()>> {
        manager
            .trigger_negotiations()
            .into_iter()
            .map(|session| {
                let this = self.clone();
                let manager = Arc::clone(manager);
                tokio::spawn(async move {
                    // failures are logged and reported inside
                    let _ = this.trigger(&manager, &session).await;
                })
            })
            .collect()
    }

    /// Negotiate on behalf of `session`.
    ///
    /// A session whose usage crossed the threshold gets a fresh successor,
    /// which is then negotiated. A `Sending` session is an unconfirmed one
    /// being resent and is negotiated itself. Failures are logged and
    /// reported before they are returned.
    pub async fn trigger(
        &self,
        manager: &Arc<Manager<S>>,
        session: &Arc<Session<S>>,
    ) -> Result<(), RekeyError> {
        let result = self.start_negotiation(manager, session).await;
        if let Err(e) = &result {
            tracing::error!(session = %session, error = %e, "rekey negotiation failed");
            self.reporter.report(
                NEGOTIATION_FAILED_PRIORITY,
                "Rekey",
                "NegotiationFailed",
                &e.to_string(),
            );
            self.escalate_fatal(e);
        }
        result
    }

    async fn start_negotiation(
        &self,
        manager: &Arc<Manager<S>>,
        session: &Arc<Session<S>>,
    ) -> Result<(), RekeyError> {
        match session.negotiation_status() {
            Negotiation::NewSessionTriggered => {
                let successor =
                    match manager.new_send_session(None, None, *session.params(), session) {
                        Ok(successor) => successor,
                        Err(e) => {
                            // the next check triggers the source again
                            if let Err(revert) =
                                session.try_set_negotiation_status(Negotiation::Confirmed)
                            {
                                tracing::warn!(session = %session, error = %revert, "could not reopen rekey source");
                            }
                            return Err(e.into());
                        },
                    };
                tracing::info!(source = %session, session = %successor, "rekey triggered");

                // the successor exists either way and must not be left in Sending
                let created = session.set_negotiation_status(Negotiation::NewSessionCreated);
                let negotiated = self.negotiate(manager.partner_id(), &successor).await;
                created?;
                negotiated
            },
            Negotiation::Sending => {
                tracing::info!(session = %session, "resending rekey");
                self.negotiate(manager.partner_id(), session).await
            },
            status => Err(RekeyError::InvalidNegotiationStatus { session: session.id(), status }),
        }
    }

    /// Send the trigger for `session` and record the outcome.
    ///
    /// On any delivery failure the session drops back to `Unconfirmed`, so a
    /// later check resends it.
    pub async fn negotiate(
        &self,
        partner: PartnerId,
        session: &Arc<Session<S>>,
    ) -> Result<(), RekeyError> {
        let payload = RekeyTrigger::for_session(session.as_ref()).encode()?;

        let report = match self
            .sender
            .send_e2e(self.params.trigger, partner, payload, SendParams::rekey("kx.Trigger"))
            .await
        {
            Ok(report) => report,
            Err(e) => {
                revert(session);
                return Err(e.into());
            },
        };

        let results = self.rounds.track(&report.rounds, self.params.round_timeout).await;
        if !results.all_succeeded() {
            revert(session);
            return Err(RekeyError::Transmission { session: session.id(), reason: results.to_string() });
        }

        if let Err(e) = session.try_set_negotiation_status(Negotiation::Sent) {
            if session.negotiation_status() == Negotiation::NewSessionTriggered {
                return Err(RekeyError::Exhausted { session: session.id() });
            }
            // a confirm that raced the round results already moved it on
            if session.is_confirmed() {
                tracing::debug!(session = %session, "confirmed before rounds completed");
                return Ok(());
            }
            return Err(e.into());
        }

        tracing::info!(session = %session, rounds = report.rounds.len(), "rekey trigger sent");
        Ok(())
    }

    /// Handle a partner's trigger: create the mirror receive session and
    /// confirm it.
    ///
    /// A replayed trigger finds the existing session and is confirmed again.
    pub async fn handle_trigger(&self, message: &ReceivedMessage) -> Result<(), RekeyError> {
        if !message.encrypted {
            return Err(RekeyError::NotEndToEnd);
        }
        let manager = self.partner(message.sender)?;

        let trigger = RekeyTrigger::decode(&message.payload)?;
        let (public, pq_public) = trigger.public_keys::<S>()?;
        let source = manager
            .get_receive_session(trigger.session_id)
            .ok_or(RekeyError::UnknownSession { session: trigger.session_id })?;

        // a bad key from the partner is their fault, not a local fault
        let (session, duplicate) = manager
            .new_receive_session(public, pq_public, *source.params(), &source)
            .map_err(|e| match e {
                RatchetError::Crypto(e) => RekeyError::Malformed { reason: e.to_string() },
                e => RekeyError::Ratchet(e),
            })?;
        if duplicate {
            tracing::info!(session = %session, "duplicate rekey trigger");
        } else {
            self.garbled.check_garbled_messages();
        }

        let payload = RekeyConfirm { session_id: session.id() }.encode()?;
        let report = self
            .sender
            .send_e2e(self.params.confirm, message.sender, payload, SendParams::rekey("kx.Confirm"))
            .await?;

        let rounds = Arc::clone(&self.rounds);
        let timeout = self.params.round_timeout;
        let id = session.id();
        tokio::spawn(async move {
            let results = rounds.track(&report.rounds, timeout).await;
            if !results.all_succeeded() {
                tracing::warn!(session = %id, %results, "rekey confirm not delivered");
            }
        });

        Ok(())
    }

    /// Handle a partner's confirm: mark the send session confirmed and prune
    /// the oldest confirmed sessions.
    pub async fn handle_confirm(&self, message: &ReceivedMessage) -> Result<(), RekeyError> {
        if !message.encrypted {
            return Err(RekeyError::NotEndToEnd);
        }
        let manager = self.partner(message.sender)?;

        let confirm = RekeyConfirm::decode(&message.payload)?;
        let session = manager
            .get_send_session(confirm.session_id)
            .ok_or(RekeyError::UnknownSession { session: confirm.session_id })?;

        if session.is_confirmed() {
            tracing::debug!(session = %session, "duplicate rekey confirm");
            return Ok(());
        }

        match manager.confirm(session.id()) {
            Ok(()) => {
                tracing::info!(session = %session, "rekey confirmed");
                Ok(())
            },
            Err(RatchetError::IllegalNegotiationTransition { from, to }) => {
                tracing::warn!(session = %session, %from, %to, "confirm for session in unexpected status");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Handle inbound rekey messages until `shutdown` turns true, its sender
    /// is dropped, or both channels close.
    ///
    /// Each message is handled in its own task. Handler errors are logged;
    /// fatal ones are also reported.
    pub fn spawn_listener(
        &self,
        mut triggers: mpsc::Receiver<ReceivedMessage>,
        mut confirms: mpsc::Receiver<ReceivedMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut triggers_open = true;
            let mut confirms_open = true;

            while triggers_open || confirms_open {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    message = triggers.recv(), if triggers_open => match message {
                        Some(message) => {
                            let this = this.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_trigger(&message).await {
                                    this.log_dropped("trigger", message.sender, &e);
                                }
                            });
                        },
                        None => triggers_open = false,
                    },
                    message = confirms.recv(), if confirms_open => match message {
                        Some(message) => {
                            let this = this.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_confirm(&message).await {
                                    this.log_dropped("confirm", message.sender, &e);
                                }
                            });
                        },
                        None => confirms_open = false,
                    },
                }
            }
            tracing::debug!("rekey listener stopped");
        })
    }

    fn log_dropped(&self, kind: &str, sender: PartnerId, error: &RekeyError) {
        if error.is_fatal() {
            self.escalate_fatal(error);
        } else {
            tracing::warn!(%sender, kind, %error, "rekey message dropped");
        }
    }

    /// Report `error` if it is fatal. The session store can no longer be
    /// trusted, which only the embedding application can act on.
    fn escalate_fatal(&self, error: &RekeyError) {
        if !error.is_fatal() {
            return;
        }
        tracing::error!(%error, "fatal fault while rekeying");
        self.reporter.report(FATAL_PRIORITY, "Rekey", "FatalError", &error.to_string());
    }

    fn partner(&self, partner: PartnerId) -> Result<Arc<Manager<S>>, RekeyError> {
        self.ratchet.get_partner(partner).map_err(|_| RekeyError::UnknownPartner { partner })
    }
}

fn revert<S: Suite>(session: &Session<S>) {
    if let Err(e) = session.try_set_negotiation_status(Negotiation::Unconfirmed) {
        tracing::warn!(session = %session, error = %e, "could not revert negotiation status");
    }
}
