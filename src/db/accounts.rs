//! Encrypted account store.
//!
//! Keyed by the encrypted private key. Records are created in bulk from the
//! input lists, handed out once per run as [`WorkItem`]s, and either deleted on
//! success or marked failed for the next run. Transient failure statuses are
//! reset to `to_run` at load time, which is what makes a killed run resumable.

use crate::crypto::Keychain;
use crate::db::reports::ReportStore;
use crate::db::{read_doc, write_doc};
use crate::error::{Result, StoreError};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    ToRun,
    Completed,
    Failed,
    /// Blocked by an anti-bot challenge. Resumable, same as `Failed`.
    Cloudflare,
}

impl ModuleStatus {
    /// Statuses reset to `to_run` on the next load.
    pub fn is_resumable(self) -> bool {
        matches!(self, ModuleStatus::Failed | ModuleStatus::Cloudflare)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    pub status: ModuleStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub address: String,
    pub modules: Vec<ModuleEntry>,
    pub recipient: Option<String>,
    pub proxy: Option<String>,
}

type AccountsDoc = BTreeMap<String, AccountRecord>;

/// One account's pending claim module plus routing metadata — the unit the
/// scheduler dispatches.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub private_key: String,
    pub encoded_key: String,
    pub address: String,
    pub proxy: Option<String>,
    pub recipient: Option<String>,
    pub module: ModuleEntry,
}

/// Durable account queue. Cheap to clone; all clones share the same document
/// lock.
#[derive(Clone)]
pub struct AccountStore {
    path: Arc<PathBuf>,
    keychain: Arc<Keychain>,
    lock: Arc<Mutex<()>>,
    shuffle: bool,
}

impl AccountStore {
    pub fn new(path: PathBuf, keychain: Arc<Keychain>, shuffle: bool) -> Self {
        Self {
            path: Arc::new(path),
            keychain,
            lock: Arc::new(Mutex::new(())),
            shuffle,
        }
    }

    /// Build fresh records from the input lists, one claim module each.
    /// Replaces the whole accounts document and clears the report store.
    pub async fn create(
        &self,
        reports: &ReportStore,
        private_keys: Vec<String>,
        recipients: Vec<String>,
        proxies: Vec<String>,
        transfers_enabled: bool,
    ) -> Result<usize> {
        if private_keys.is_empty() {
            return Err(StoreError::Config("no private keys supplied".into()).into());
        }
        if transfers_enabled && recipients.is_empty() {
            return Err(StoreError::Config(
                "recipients are required when a post-claim transfer mode is enabled".into(),
            )
            .into());
        }
        if !recipients.is_empty() && recipients.len() != private_keys.len() {
            return Err(StoreError::Config(format!(
                "recipient count ({}) must match private key count ({}) or be zero",
                recipients.len(),
                private_keys.len()
            ))
            .into());
        }

        let proxies = normalize_proxies(proxies);
        if proxies.is_empty() {
            tracing::warn!("no proxies supplied, accounts will run without one");
        }

        let cipher = self.keychain.encryption_cipher();
        let mut doc = AccountsDoc::new();
        for (index, private_key) in private_keys.iter().enumerate() {
            let address = crate::wallet::derive_address(private_key).map_err(|_| {
                StoreError::Config(format!("invalid private key on line {}", index + 1))
            })?;
            let record = AccountRecord {
                address,
                modules: vec![ModuleEntry {
                    name: "claim".into(),
                    status: ModuleStatus::ToRun,
                }],
                recipient: recipients.get(index).cloned(),
                proxy: if proxies.is_empty() {
                    None
                } else {
                    Some(proxies[index % proxies.len()].clone())
                },
            };
            doc.insert(cipher.encrypt(private_key), record);
        }

        reports.clear().await?;

        let created = doc.len();
        let _guard = self.lock.lock().await;
        write_doc(self.path.as_ref(), &doc)?;
        tracing::info!(accounts = created, "created account database");
        Ok(created)
    }

    /// Pull the full work queue: reset transient failure statuses, decrypt
    /// every key, one item per account with only the head module. An empty
    /// result means no accounts remain.
    pub async fn load_all(&self) -> Result<Vec<WorkItem>> {
        let doc = {
            let _guard = self.lock.lock().await;
            let mut doc: AccountsDoc = read_doc(self.path.as_ref())?;
            if doc.is_empty() {
                return Ok(Vec::new());
            }
            if reset_transient_failures(&mut doc) > 0 {
                write_doc(self.path.as_ref(), &doc)?;
            }
            doc
        };

        // Password resolution happens outside the document lock; it may block
        // on an interactive prompt.
        let sample = doc.keys().next().expect("non-empty document").clone();
        let cipher = self.keychain.decryption_cipher(&sample)?;

        let mut items = Vec::with_capacity(doc.len());
        for (encoded_key, record) in doc {
            let private_key = cipher
                .decrypt(&encoded_key)
                .map_err(|_| StoreError::Decryption)?;
            let module = record
                .modules
                .first()
                .cloned()
                .ok_or_else(|| StoreError::Config(format!("{}: record has no modules", record.address)))?;
            items.push(WorkItem {
                private_key,
                encoded_key,
                address: record.address,
                proxy: record.proxy,
                recipient: record.recipient,
                module,
            });
        }

        if self.shuffle {
            items.shuffle(&mut rand::thread_rng());
        }
        Ok(items)
    }

    /// Settle an account after its pipeline ended: delete the record when the
    /// run completed, otherwise mark every module failed for the next run.
    pub async fn remove(&self, encoded_key: &str, completed: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc: AccountsDoc = read_doc(self.path.as_ref())?;
        if completed {
            doc.remove(encoded_key);
        } else if let Some(record) = doc.get_mut(encoded_key) {
            for module in &mut record.modules {
                module.status = ModuleStatus::Failed;
            }
        }
        write_doc(self.path.as_ref(), &doc)?;
        Ok(())
    }

    /// Number of accounts still in the queue.
    pub async fn count(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let doc: AccountsDoc = read_doc(self.path.as_ref())?;
        Ok(doc.len())
    }
}

/// Reset every resumable module status back to `to_run`. Returns how many
/// modules changed.
pub fn reset_transient_failures(doc: &mut AccountsDoc) -> usize {
    let mut changed = 0;
    for record in doc.values_mut() {
        for module in &mut record.modules {
            if module.status.is_resumable() {
                module.status = ModuleStatus::ToRun;
                changed += 1;
            }
        }
    }
    changed
}

/// Drop placeholder and blank proxy lines, normalize the scheme to `http://`.
pub fn normalize_proxies(proxies: Vec<String>) -> Vec<String> {
    const PLACEHOLDERS: &[&str] = &[
        "https://log:pass@ip:port",
        "http://log:pass@ip:port",
        "log:pass@ip:port",
        "http://login:password@ip:port",
    ];
    proxies
        .into_iter()
        .map(|proxy| proxy.trim().to_string())
        .filter(|proxy| !proxy.is_empty() && !PLACEHOLDERS.contains(&proxy.as_str()))
        .map(|proxy| {
            let stripped = proxy
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            format!("http://{stripped}")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Outcome;
    use tempfile::TempDir;

    // A valid secp256k1 private key; address derivation only, never funded.
    const PK_1: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const PK_2: &str = "0x0000000000000000000000000000000000000000000000000000000000000002";
    const PK_3: &str = "0x0000000000000000000000000000000000000000000000000000000000000003";

    fn fixtures(dir: &TempDir) -> (AccountStore, ReportStore) {
        let keychain = Arc::new(Keychain::with_password("test"));
        let store = AccountStore::new(dir.path().join("modules.json"), keychain, false);
        let reports = ReportStore::new(dir.path().join("report.json"));
        (store, reports)
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_then_load_yields_one_item_per_key() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);

        let created = store
            .create(&reports, keys(&[PK_1, PK_2, PK_3]), vec![], vec![], false)
            .await
            .expect("create");
        assert_eq!(created, 3);

        let items = store.load_all().await.expect("load");
        assert_eq!(items.len(), 3);
        for item in &items {
            assert_eq!(item.module.name, "claim");
            assert_eq!(item.module.status, ModuleStatus::ToRun);
            assert!(item.address.starts_with("0x"));
            assert!(item.private_key.starts_with("0x"));
        }
    }

    #[tokio::test]
    async fn proxies_cycle_round_robin() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);

        store
            .create(
                &reports,
                keys(&[PK_1, PK_2, PK_3]),
                vec![],
                keys(&["http://a:1@h:1", "b:2@h:2"]),
                false,
            )
            .await
            .expect("create");

        let mut items = store.load_all().await.expect("load");
        // BTreeMap order is by encrypted key; sort by address-derived key order
        // instead: count proxy usage.
        items.sort_by(|a, b| a.address.cmp(&b.address));
        let mut proxies: Vec<_> = items.iter().filter_map(|i| i.proxy.clone()).collect();
        proxies.sort();
        assert_eq!(
            proxies,
            vec![
                "http://a:1@h:1".to_string(),
                "http://a:1@h:1".to_string(),
                "http://b:2@h:2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn recipient_count_mismatch_is_config_error() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);

        let err = store
            .create(
                &reports,
                keys(&[PK_1, PK_2, PK_3]),
                keys(&["0x1111111111111111111111111111111111111111"]),
                vec![],
                false,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn transfers_without_recipients_is_config_error() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);

        let err = store
            .create(&reports, keys(&[PK_1]), vec![], vec![], true)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn create_clears_previous_reports() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);

        reports
            .append("stale", "old line", Outcome::Success)
            .await
            .expect("append");
        store
            .create(&reports, keys(&[PK_1]), vec![], vec![], false)
            .await
            .expect("create");

        let rendered = reports
            .drain_and_render("stale", "0xabc", (1, 1))
            .await
            .expect("drain");
        assert!(rendered.contains("No actions"));
    }

    #[tokio::test]
    async fn failed_account_is_requeued_completed_account_is_gone() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);
        store
            .create(&reports, keys(&[PK_1, PK_2]), vec![], vec![], false)
            .await
            .expect("create");

        let items = store.load_all().await.expect("load");
        store.remove(&items[0].encoded_key, true).await.expect("remove");
        store.remove(&items[1].encoded_key, false).await.expect("remove");

        let remaining = store.load_all().await.expect("reload");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].encoded_key, items[1].encoded_key);
        // The failed status was reset to to_run by the reload.
        assert_eq!(remaining[0].module.status, ModuleStatus::ToRun);
    }

    #[tokio::test]
    async fn wrong_preset_password_fails_loudly() {
        let dir = TempDir::new().expect("tempdir");
        let (store, reports) = fixtures(&dir);
        store
            .create(&reports, keys(&[PK_1]), vec![], vec![], false)
            .await
            .expect("create");

        let wrong = AccountStore::new(
            dir.path().join("modules.json"),
            Arc::new(Keychain::with_password("other")),
            false,
        );
        let err = wrong.load_all().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn reset_transient_failures_is_idempotent() {
        let mut doc = AccountsDoc::new();
        doc.insert(
            "k".into(),
            AccountRecord {
                address: "0xabc".into(),
                modules: vec![
                    ModuleEntry { name: "claim".into(), status: ModuleStatus::Failed },
                    ModuleEntry { name: "claim".into(), status: ModuleStatus::Cloudflare },
                    ModuleEntry { name: "claim".into(), status: ModuleStatus::Completed },
                ],
                recipient: None,
                proxy: None,
            },
        );

        assert_eq!(reset_transient_failures(&mut doc), 2);
        assert_eq!(reset_transient_failures(&mut doc), 0);
        let record = doc.get("k").expect("record");
        assert_eq!(record.modules[0].status, ModuleStatus::ToRun);
        assert_eq!(record.modules[1].status, ModuleStatus::ToRun);
        assert_eq!(record.modules[2].status, ModuleStatus::Completed);
    }

    #[test]
    fn proxy_normalization_filters_placeholders() {
        let proxies = normalize_proxies(vec![
            "https://user:pw@host:8080".into(),
            "log:pass@ip:port".into(),
            "".into(),
            "bare:1@h:2".into(),
        ]);
        assert_eq!(
            proxies,
            vec!["http://user:pw@host:8080".to_string(), "http://bare:1@h:2".to_string()]
        );
    }
}
