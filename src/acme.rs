//! ACME (Let's Encrypt) certificate issuance
//!
//! HTTP-01 only: challenge tokens are published in the shared
//! [`ChallengeTable`] and answered by the plain-HTTP listener at
//! `/.well-known/acme-challenge/<token>`. Issuance failures are
//! non-fatal; the certificate orchestrator falls back to a self-signed
//! certificate and keeps serving traffic.
//!
//! # Security Considerations
//!
//! The ACME account key and certificate private keys are stored
//! unencrypted in the config directory with restrictive permissions
//! (0600 on Unix). Keep that directory on an encrypted filesystem and
//! restricted to the service user.

use crate::cert_store::CertStore;
use anyhow::{Context, Result};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

const AUTHZ_POLL_INTERVAL: Duration = Duration::from_secs(2);
const AUTHZ_POLL_ATTEMPTS: u32 = 30;

/// Pending HTTP-01 challenges: token to key authorization.
///
/// Mutated only by the issuer for the duration of one issuance; the
/// HTTP listener performs single lookups.
#[derive(Clone, Default)]
pub struct ChallengeTable {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Drives HTTP-01 issuance for public hostnames
pub struct AcmeClient {
    directory_url: String,
    email: Option<String>,
    agree_to_terms: bool,
    store: Arc<CertStore>,
    challenges: ChallengeTable,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub fn new(
        directory_url: String,
        email: Option<String>,
        agree_to_terms: bool,
        store: Arc<CertStore>,
        challenges: ChallengeTable,
    ) -> Self {
        Self {
            directory_url,
            email,
            agree_to_terms,
            store,
            challenges,
            account: OnceCell::new(),
        }
    }

    pub fn challenges(&self) -> ChallengeTable {
        self.challenges.clone()
    }

    /// Load or create the ACME account. Credentials are persisted next
    /// to the certificates so the account key survives restarts.
    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                let account_path = self.store.dir().join("account.json");

                if account_path.exists() {
                    debug!(path = %account_path.display(), "Loading existing ACME account");
                    let data = std::fs::read_to_string(&account_path)?;
                    let credentials: AccountCredentials = serde_json::from_str(&data)?;
                    let account = Account::from_credentials(credentials).await?;
                    return Ok(account);
                }

                if !self.agree_to_terms {
                    anyhow::bail!("ACME account creation requires agreeToTerms in the config");
                }
                let email = self
                    .email
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("ACME account creation requires an email"))?;

                info!(directory = %self.directory_url, "Creating new ACME account");
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&format!("mailto:{}", email)],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await?;

                let data = serde_json::to_string_pretty(&credentials)?;
                std::fs::write(&account_path, data)?;
                info!(path = %account_path.display(), "ACME account credentials saved");

                Ok(account)
            })
            .await
    }

    /// Obtain a certificate for `host` (plus its alt names) via HTTP-01
    /// and persist it through the certificate store. Returns the PEM
    /// chain and private key.
    pub async fn issue(&self, host: &str, alt_names: &[String]) -> Result<(String, String)> {
        let account = self.account().await?;

        let mut names = vec![host.to_lowercase()];
        for name in alt_names {
            let name = name.to_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let identifiers: Vec<Identifier> =
            names.iter().map(|n| Identifier::Dns(n.clone())).collect();

        info!(host, names = ?names, "Requesting certificate via ACME");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if matches!(authz.status, AuthorizationStatus::Valid) {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    anyhow::anyhow!("HTTP-01 challenge not offered for {}", identifier)
                })?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %identifier, token = %challenge.token, "Publishing HTTP-01 challenge");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;

            order.set_challenge_ready(&challenge.url).await?;

            let result = self.await_authorization(&mut order, &identifier).await;

            // The token is only valid for this one issuance
            self.challenges.remove(&challenge.token).await;
            result?;
        }

        // Wait for the order to become ready for finalization
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("ACME order invalid for {}", host),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > AUTHZ_POLL_ATTEMPTS {
                        anyhow::bail!("ACME order timed out for {}", host);
                    }
                    tokio::time::sleep(AUTHZ_POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        // CSR: commonName = host, SANs = the full name set
        let mut params = CertificateParams::new(names.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_lowercase());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("ACME order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > AUTHZ_POLL_ATTEMPTS {
                        anyhow::bail!("timed out waiting for certificate for {}", host);
                    }
                    tokio::time::sleep(AUTHZ_POLL_INTERVAL).await;
                }
                status => anyhow::bail!("unexpected ACME order status: {:?}", status),
            }
        };

        let key_pem = private_key.serialize_pem();
        self.store
            .write(&host.to_lowercase(), &cert_chain_pem, &key_pem)
            .context("failed to persist ACME certificate")?;

        info!(host, "Certificate obtained via ACME");
        Ok((cert_chain_pem, key_pem))
    }

    async fn await_authorization(
        &self,
        order: &mut instant_acme::Order,
        identifier: &str,
    ) -> Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(AUTHZ_POLL_INTERVAL).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let current = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > AUTHZ_POLL_ATTEMPTS {
                        anyhow::bail!("authorization timed out for {}", identifier);
                    }
                    debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("authorization failed for {}", identifier);
                }
                Some(status) => {
                    debug!(domain = %identifier, status = ?status, "Authorization status");
                }
                None => anyhow::bail!("authorization not found for {}", identifier),
            }
        }
    }
}
