//! Top-level store of all partners
//!
//! The ratchet record holds only this identity's key pair and the list of
//! partner ids. Each [`Manager`] loads its own sub-tree, so saving the
//! ratchet costs one write regardless of how many sessions exist.
//!
//! Lock order: `managers` before `services`.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use tandem_crypto::{CryptoError, DhPrivate, DhPublic, KeyExchange, Suite};
use zeroize::Zeroize;

use crate::{
    error::RatchetError,
    ids::PartnerId,
    lock,
    manager::Manager,
    params::SessionParams,
    services::{Processor, ServiceHandler},
    session::{CypherHandler, SessionKeys},
    storage::Store,
};

/// Record format version for the ratchet record
const RATCHET_VERSION: u64 = 0;

/// Storage key of the ratchet record
const RATCHET_KEY: &str = "ratchet";

#[derive(Serialize, Deserialize)]
struct RatchetRecord {
    my_id: PartnerId,
    dh_variant: u8,
    dh_private: Vec<u8>,
    partners: Vec<PartnerId>,
}

impl Drop for RatchetRecord {
    fn drop(&mut self) {
        self.dh_private.zeroize();
    }
}

/// All partners of one identity.
pub struct Ratchet<S: Suite> {
    store: Store,
    my_id: PartnerId,
    dh_private: DhPrivate<S>,
    managers: RwLock<HashMap<PartnerId, Arc<Manager<S>>>>,
    services: RwLock<HashMap<String, Arc<dyn Processor>>>,
    service_handler: Arc<dyn ServiceHandler>,
    cypher_handler: Arc<dyn CypherHandler<S>>,
}

impl<S: Suite> Ratchet<S> {
    /// Create an empty ratchet and persist it.
    pub fn new(
        store: Store,
        my_id: PartnerId,
        dh_private: DhPrivate<S>,
        service_handler: Arc<dyn ServiceHandler>,
        cypher_handler: Arc<dyn CypherHandler<S>>,
    ) -> Result<Self, RatchetError> {
        let ratchet = Self {
            store,
            my_id,
            dh_private,
            managers: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            service_handler,
            cypher_handler,
        };
        ratchet.save(&HashMap::new())?;

        tracing::info!(id = %my_id, "ratchet created");
        Ok(ratchet)
    }

    /// Load a persisted ratchet and every partner in it.
    ///
    /// Services are not persisted; register them again with
    /// [`Ratchet::add_service`].
    pub fn load(
        store: Store,
        service_handler: Arc<dyn ServiceHandler>,
        cypher_handler: Arc<dyn CypherHandler<S>>,
    ) -> Result<Self, RatchetError> {
        let record: RatchetRecord = store.load_record(RATCHET_KEY, RATCHET_VERSION)?;
        if record.dh_variant != S::Dh::VARIANT {
            return Err(CryptoError::VariantMismatch {
                expected: S::Dh::VARIANT,
                actual: record.dh_variant,
            }
            .into());
        }
        let dh_private = S::Dh::decode_private(&record.dh_private)?;

        let mut managers = HashMap::with_capacity(record.partners.len());
        for &partner in &record.partners {
            let manager = Manager::load(&store, record.my_id, partner, Arc::clone(&cypher_handler))?;
            managers.insert(partner, Arc::new(manager));
        }

        tracing::info!(id = %record.my_id, partners = managers.len(), "ratchet loaded");

        Ok(Self {
            store,
            my_id: record.my_id,
            dh_private,
            managers: RwLock::new(managers),
            services: RwLock::new(HashMap::new()),
            service_handler,
            cypher_handler,
        })
    }

    /// Own identity.
    pub fn my_id(&self) -> PartnerId {
        self.my_id
    }

    /// Own long-term private key.
    pub fn dh_private(&self) -> &DhPrivate<S> {
        &self.dh_private
    }

    /// Own long-term public key.
    pub fn dh_public(&self) -> DhPublic<S> {
        S::Dh::public_key(&self.dh_private)
    }

    /// Add a partner whose first sessions are built from `keys`.
    ///
    /// An existing partner is never replaced; delete it first.
    pub fn add_partner(
        &self,
        partner: PartnerId,
        keys: SessionKeys<S>,
        send_params: SessionParams,
        receive_params: SessionParams,
    ) -> Result<Arc<Manager<S>>, RatchetError> {
        let mut managers = lock::write(&self.managers);
        if managers.contains_key(&partner) {
            return Err(RatchetError::PartnerExists { partner });
        }

        let manager = Arc::new(Manager::new(
            &self.store,
            self.my_id,
            partner,
            keys,
            send_params,
            receive_params,
            Arc::clone(&self.cypher_handler),
        )?);
        managers.insert(partner, Arc::clone(&manager));
        if let Err(e) = self.save(&managers) {
            managers.remove(&partner);
            if let Err(cleanup) = manager.delete() {
                tracing::error!(%partner, error = %cleanup, "failed to remove unsaved partner");
            }
            return Err(e);
        }

        let services = lock::read(&self.services);
        for (tag, processor) in services.iter() {
            self.service_handler.add_service(manager.make_service(tag), Arc::clone(processor));
        }

        Ok(manager)
    }

    /// Manager of `partner`.
    pub fn get_partner(&self, partner: PartnerId) -> Result<Arc<Manager<S>>, RatchetError> {
        lock::read(&self.managers)
            .get(&partner)
            .cloned()
            .ok_or(RatchetError::UnknownPartner { partner })
    }

    /// Remove a partner, its services and all of its key material.
    pub fn delete_partner(&self, partner: PartnerId) -> Result<(), RatchetError> {
        let mut managers = lock::write(&self.managers);
        let manager =
            managers.get(&partner).cloned().ok_or(RatchetError::UnknownPartner { partner })?;

        {
            let services = lock::read(&self.services);
            for (tag, processor) in services.iter() {
                self.service_handler.delete_service(&manager.make_service(tag), processor);
            }
        }

        manager.delete()?;
        managers.remove(&partner);
        self.save(&managers)
    }

    /// Every partner id, sorted.
    pub fn all_partner_ids(&self) -> Vec<PartnerId> {
        let mut ids: Vec<_> = lock::read(&self.managers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Register `processor` for `tag` on every current and future partner.
    pub fn add_service(&self, tag: &str, processor: Arc<dyn Processor>) -> Result<(), RatchetError> {
        let managers = lock::read(&self.managers);
        let mut services = lock::write(&self.services);
        if services.contains_key(tag) {
            return Err(RatchetError::ServiceExists { tag: tag.to_string() });
        }

        for manager in managers.values() {
            self.service_handler.add_service(manager.make_service(tag), Arc::clone(&processor));
        }
        services.insert(tag.to_string(), processor);
        Ok(())
    }

    /// Unregister the processor for `tag` from every partner.
    pub fn remove_service(&self, tag: &str) -> Result<(), RatchetError> {
        let managers = lock::read(&self.managers);
        let mut services = lock::write(&self.services);
        let processor =
            services.remove(tag).ok_or_else(|| RatchetError::UnknownService { tag: tag.to_string() })?;

        for manager in managers.values() {
            self.service_handler.delete_service(&manager.make_service(tag), &processor);
        }
        Ok(())
    }

    fn save(&self, managers: &HashMap<PartnerId, Arc<Manager<S>>>) -> Result<(), RatchetError> {
        let mut partners: Vec<_> = managers.keys().copied().collect();
        partners.sort_unstable();

        let record = RatchetRecord {
            my_id: self.my_id,
            dh_variant: S::Dh::VARIANT,
            dh_private: S::Dh::encode_private(&self.dh_private).to_vec(),
            partners,
        };
        self.store.set_record(RATCHET_KEY, RATCHET_VERSION, &record)?;
        Ok(())
    }
}
