//! Firewall Rule Engine - Core implementation

use std::sync::Arc;

use tracing::{info, instrument, warn};

use sbc_netcfg_common::model::FirewallRuleIntent;
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::HostExecutor;
use sbc_netcfg_common::{
    Applied, Applier, Backend, Detector, IntentStore, NetCfgError, NetCfgResult, ParseOutcome,
};

use crate::backend::FirewallBackend;

/// Firewall Rule Engine
///
/// Declared rules live in the intent store ordered by (chain, position).
/// Every mutation re-renders the complete managed rule set so the kernel
/// always matches the declared order.
pub struct FwMgr {
    store: Arc<IntentStore>,
    exec: Arc<dyn HostExecutor>,
    settings: Arc<Settings>,
    detector: Arc<Detector>,
    applier: Arc<Applier>,
}

impl FwMgr {
    pub fn new(
        store: Arc<IntentStore>,
        exec: Arc<dyn HostExecutor>,
        settings: Arc<Settings>,
        detector: Arc<Detector>,
        applier: Arc<Applier>,
    ) -> Self {
        Self {
            store,
            exec,
            settings,
            detector,
            applier,
        }
    }

    pub async fn backend(&self) -> NetCfgResult<FirewallBackend> {
        let kind = self.detector.firewall_backend().await?;
        Ok(FirewallBackend::for_kind(kind, &self.settings))
    }

    pub fn list_rules(&self) -> NetCfgResult<Vec<FirewallRuleIntent>> {
        self.store.list_firewall_rules()
    }

    pub fn get_rule(&self, id: i64) -> NetCfgResult<Option<FirewallRuleIntent>> {
        self.store.get_firewall_rule(id)
    }

    /// Inserts a rule and applies the rule set.
    ///
    /// With `position` the rule is inserted there and later rules in the
    /// chain move down one slot; without it the rule is appended.
    #[instrument(skip(self, rule), fields(chain = %rule.chain))]
    pub async fn create_rule(
        &self,
        mut rule: FirewallRuleIntent,
        position: Option<u32>,
    ) -> NetCfgResult<(i64, Applied)> {
        rule.validate()?;
        rule.position = match position {
            Some(p) => p,
            None => self.store.next_position(&rule.chain)?,
        };

        let existing = self.list_rules()?;
        if let Some(dup) = existing.iter().find(|r| r.same_match(&rule)) {
            warn!(
                "Rule duplicates {} rule at position {} (id {:?})",
                dup.chain, dup.position, dup.id
            );
        }

        let id = self.store.insert_firewall_rule(&rule)?;
        info!(
            "Created {} rule {} at position {}",
            rule.chain,
            id,
            rule.position
        );
        let applied = self.apply().await?;
        Ok((id, applied))
    }

    #[instrument(skip(self))]
    pub async fn delete_rule(&self, id: i64) -> NetCfgResult<Applied> {
        if !self.store.delete_firewall_rule(id)? {
            return Err(NetCfgError::validation("id", format!("no firewall rule {}", id)));
        }
        info!("Deleted firewall rule {}", id);
        self.apply().await
    }

    #[instrument(skip(self))]
    pub async fn set_rule_enabled(&self, id: i64, enabled: bool) -> NetCfgResult<Applied> {
        if !self.store.set_firewall_rule_enabled(id, enabled)? {
            return Err(NetCfgError::validation("id", format!("no firewall rule {}", id)));
        }
        info!("Firewall rule {} enabled={}", id, enabled);
        self.apply().await
    }

    /// Renders every declared rule with the active backend and applies it.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> NetCfgResult<Applied> {
        let rules = self.list_rules()?;
        let backend = self.backend().await?;
        let artifact = backend.synthesize(&rules)?;
        info!(
            "Applying {} firewall rules via {}",
            rules.iter().filter(|r| r.enabled).count(),
            backend.kind()
        );
        self.applier.apply(&artifact).await
    }

    /// Rules currently loaded in the kernel.
    pub async fn live(&self) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        let backend = self.backend().await?;
        let outcome = backend.read_live(self.exec.as_ref()).await?;
        outcome.log_warnings(&backend.kind().to_string());
        Ok(outcome)
    }

    /// Imports live rules no declared rule matches, appended per chain.
    ///
    /// Returns the number imported. Nothing is applied.
    #[instrument(skip(self))]
    pub async fn adopt_live(&self) -> NetCfgResult<usize> {
        let live = self.live().await?.records;
        let declared = self.list_rules()?;
        let mut imported = 0;

        for mut rule in live {
            if declared.iter().any(|d| d.same_match(&rule)) {
                continue;
            }
            if let Err(e) = rule.validate() {
                warn!("Not adopting {} rule: {}", rule.chain, e);
                continue;
            }
            rule.position = self.store.next_position(&rule.chain)?;
            let id = self.store.insert_firewall_rule(&rule)?;
            info!("Adopted {} rule as {}", rule.chain, id);
            imported += 1;
        }
        Ok(imported)
    }
}
