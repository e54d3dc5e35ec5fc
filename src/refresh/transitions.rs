use std::collections::{HashMap, HashSet};

use super::quota::{CategoryQuota, QuotaCategory};
use crate::events::NotificationEvent;
use crate::management::{AccountStatus, AuthFile};

/// Last status seen per account, used to turn polled snapshots into
/// cooling transitions.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last_known: HashMap<String, AccountStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, files: &[AuthFile]) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        for file in files {
            let status = file.account_status();
            let previous = self.last_known.insert(file.account_key(), status.clone());

            match (&previous, &status) {
                (Some(AccountStatus::Cooling), AccountStatus::Cooling) => {}
                (_, AccountStatus::Cooling) => events.push(NotificationEvent::AccountCooling {
                    provider: file.provider.clone(),
                    account: file.account_label().to_string(),
                }),
                (Some(AccountStatus::Cooling), AccountStatus::Ready) => {
                    events.push(NotificationEvent::AccountCoolingCleared {
                        provider: file.provider.clone(),
                        account: file.account_label().to_string(),
                    })
                }
                _ => {}
            }
        }
        events
    }

    pub fn status_of(&self, account_key: &str) -> Option<&AccountStatus> {
        self.last_known.get(account_key)
    }

    pub fn reset(&mut self) {
        self.last_known.clear();
    }
}

/// Remembers which accounts currently have an active low-quota alert.
#[derive(Debug, Default)]
pub struct QuotaAlertTracker {
    alerted: HashSet<(QuotaCategory, String)>,
}

impl QuotaAlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once per completed quota pass over every category snapshot.
    pub fn evaluate(
        &mut self,
        quotas: &HashMap<QuotaCategory, CategoryQuota>,
        threshold: f64,
    ) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        let mut categories: Vec<_> = quotas.keys().copied().collect();
        categories.sort();

        for category in categories {
            let Some(accounts) = quotas.get(&category) else {
                continue;
            };
            let mut names: Vec<_> = accounts.keys().collect();
            names.sort();

            for account in names {
                let Some(min) = accounts.get(account).and_then(|q| q.min_percentage()) else {
                    continue;
                };
                let key = (category, account.clone());
                if min <= threshold {
                    if self.alerted.insert(key) {
                        events.push(NotificationEvent::QuotaLow {
                            provider: category.to_string(),
                            account: account.clone(),
                            percentage: min,
                        });
                    }
                } else if self.alerted.remove(&key) {
                    events.push(NotificationEvent::QuotaLowCleared {
                        provider: category.to_string(),
                        account: account.clone(),
                    });
                }
            }
        }
        events
    }

    pub fn reset(&mut self) {
        self.alerted.clear();
    }
}
