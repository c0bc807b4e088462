//! Signed delegation tokens.
//!
//! A token lets the holder satisfy a single failed permission check as if it
//! were the token's issuer. Tokens are JSON-encoded into the
//! [`TOKEN_HEADER_KEY`](crate::envelope::TOKEN_HEADER_KEY) header of a command
//! envelope. The signature covers the canonical JSON of the claim map.

use crate::access::AccessMode;
use crate::crypto::{KeyPair, KeyStore, SigningAlgorithm};
use crate::entity::Entity;
use crate::error::MeshError;
use crate::persistence::{Persistence, TOKENS_KEY};
use crate::types::EntityId;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CLAIM_ISSUER: &str = "iss";
pub const CLAIM_SUBJECT: &str = "sub";
pub const CLAIM_ID: &str = "id";
pub const CLAIM_ISSUED_AT: &str = "iat";
pub const CLAIM_EXPIRES: &str = "exp";
pub const CLAIM_AUDIENCE: &str = "aud";
pub const CLAIM_SCOPES: &str = "scopes";

fn invalid(reason: impl Into<String>) -> MeshError {
    MeshError::TokenInvalid {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub claims: BTreeMap<String, String>,
    pub signature: Vec<u8>,
}

impl Token {
    pub fn builder() -> TokenBuilder {
        TokenBuilder::default()
    }

    fn signing_bytes(claims: &BTreeMap<String, String>) -> Result<Vec<u8>, MeshError> {
        serde_json::to_vec(claims).map_err(|e| MeshError::MalformedMessage {
            reason: "failed to encode token claims".to_string(),
            source: Some(Box::new(e)),
        })
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }

    pub fn issuer(&self) -> Result<EntityId, MeshError> {
        self.entity_claim(CLAIM_ISSUER)?
            .ok_or_else(|| invalid("token has no issuer"))
    }

    pub fn id(&self) -> Option<&str> {
        self.claim(CLAIM_ID)
    }

    /// Granted scope names, empty when the token is not scope-restricted.
    pub fn scopes(&self) -> Vec<&str> {
        self.claim(CLAIM_SCOPES)
            .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    fn entity_claim(&self, name: &str) -> Result<Option<EntityId>, MeshError> {
        self.claim(name)
            .map(|raw| {
                raw.parse::<EntityId>()
                    .map_err(|_| invalid(format!("claim `{name}` is not an entity id")))
            })
            .transpose()
    }

    pub fn to_header(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::MalformedMessage {
            reason: "failed to encode token".to_string(),
            source: Some(Box::new(e)),
        })
    }

    pub fn from_header(raw: &str) -> Result<Self, MeshError> {
        serde_json::from_str(raw).map_err(|e| invalid(format!("malformed token header: {e}")))
    }
}

#[derive(Debug, Default, Clone)]
pub struct TokenBuilder {
    claims: BTreeMap<String, String>,
}

impl TokenBuilder {
    pub fn subject(mut self, target: EntityId) -> Self {
        self.claims
            .insert(CLAIM_SUBJECT.to_string(), target.to_string());
        self
    }

    pub fn audience(mut self, holder: EntityId) -> Self {
        self.claims
            .insert(CLAIM_AUDIENCE.to_string(), holder.to_string());
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.claims
            .insert(CLAIM_EXPIRES.to_string(), at.timestamp().to_string());
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        match at {
            Some(at) => self.expires_at(at),
            None => {
                self.claims
                    .insert(CLAIM_EXPIRES.to_string(), i64::MAX.to_string());
                self
            }
        }
    }

    pub fn scopes(mut self, scopes: &[&str]) -> Self {
        self.claims
            .insert(CLAIM_SCOPES.to_string(), scopes.join(","));
        self
    }

    pub fn claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    /// Stamp issuer, id and issue time, then sign.
    pub fn sign(
        mut self,
        issuer: EntityId,
        algorithm: &dyn SigningAlgorithm,
        key_pair: &KeyPair,
    ) -> Result<Token, MeshError> {
        self.claims
            .insert(CLAIM_ISSUER.to_string(), issuer.to_string());
        self.claims
            .entry(CLAIM_ID.to_string())
            .or_insert_with(|| format!("{:016x}", rand::random::<u64>()));
        self.claims
            .insert(CLAIM_ISSUED_AT.to_string(), Utc::now().timestamp().to_string());
        let signature = algorithm.sign(&Token::signing_bytes(&self.claims)?, key_pair)?;
        Ok(Token {
            claims: self.claims,
            signature,
        })
    }
}

/// Named bundle of command slugs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub slugs: HashSet<String>,
}

impl Scope {
    pub fn new(name: impl Into<String>, slugs: &[&str]) -> Self {
        Self {
            name: name.into(),
            slugs: slugs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.slugs.contains(slug)
    }
}

/// Registered scopes by name.
#[derive(Debug, Default)]
pub struct ScopesList {
    scopes: DashMap<String, Scope>,
}

impl ScopesList {
    pub fn register(&self, scope: Scope) {
        self.scopes.insert(scope.name.clone(), scope);
    }

    /// The granted names that refer to registered scopes.
    pub fn filter(&self, granted: &[&str]) -> Vec<Scope> {
        granted
            .iter()
            .filter_map(|name| self.scopes.get(*name).map(|s| s.value().clone()))
            .collect()
    }

    /// Whether `token` may be used for `slug`. Tokens without a scopes claim
    /// are not slug-restricted.
    pub fn authorizes(&self, token: &Token, slug: &str) -> bool {
        if token.claim(CLAIM_SCOPES).is_none() {
            return true;
        }
        self.filter(&token.scopes())
            .iter()
            .any(|scope| scope.contains(slug))
    }
}

/// Validates delegation tokens and tracks which ones were used.
pub struct TokenManager {
    keys: Arc<KeyStore>,
    algorithm: Arc<dyn SigningAlgorithm>,
    invoked: DashSet<String>,
    single_use: bool,
    scopes: ScopesList,
}

impl TokenManager {
    pub fn new(keys: Arc<KeyStore>, algorithm: Arc<dyn SigningAlgorithm>, single_use: bool) -> Self {
        Self {
            keys,
            algorithm,
            invoked: DashSet::new(),
            single_use,
            scopes: ScopesList::default(),
        }
    }

    pub fn scopes(&self) -> &ScopesList {
        &self.scopes
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Check a token presented by `sender` against `target`.
    ///
    /// In order: issuer signature, subject, audience, issuer access to the
    /// target, expiry, prior use.
    pub fn is_token_valid(
        &self,
        token: &Token,
        target: &dyn Entity,
        sender: Option<&EntityId>,
    ) -> Result<(), MeshError> {
        let issuer = token.issuer()?;
        let key = self
            .keys
            .resolve(&issuer)
            .ok_or(MeshError::InvalidSignature)?;
        let bytes = Token::signing_bytes(&token.claims)?;
        if !self.algorithm.verify(&bytes, &token.signature, &key) {
            return Err(MeshError::InvalidSignature);
        }

        if let Some(subject) = token.entity_claim(CLAIM_SUBJECT)? {
            if subject != target.id() {
                return Err(invalid(format!(
                    "token subject {subject} does not match target {}",
                    target.id()
                )));
            }
        }

        if let Some(sender) = sender {
            match token.entity_claim(CLAIM_AUDIENCE)? {
                Some(audience) if audience == *sender => {}
                Some(audience) => {
                    return Err(invalid(format!(
                        "token audience {audience} does not match sender {sender}"
                    )))
                }
                None => return Err(invalid("token has no audience")),
            }
        }

        if !target.is_allowed_access(&issuer, AccessMode::READ) {
            return Err(invalid(format!(
                "issuer {issuer} has no access to {}",
                target.id()
            )));
        }

        if let Some(exp) = token.claim(CLAIM_EXPIRES) {
            let exp: i64 = exp
                .parse()
                .map_err(|_| invalid("claim `exp` is not a timestamp"))?;
            if exp <= Utc::now().timestamp() {
                return Err(invalid("token expired"));
            }
        }

        if let Some(id) = token.id() {
            if self.invoked.contains(id) {
                return Err(invalid(format!("token {id} was already used")));
            }
        }
        Ok(())
    }

    /// Record a successful use. Only single-use managers remember ids.
    pub async fn mark_invoked(
        &self,
        token: &Token,
        persistence: &dyn Persistence,
    ) -> Result<(), MeshError> {
        if !self.single_use {
            return Ok(());
        }
        let Some(id) = token.id() else {
            return Ok(());
        };
        if self.invoked.insert(id.to_string()) {
            debug!(token_id = id, "token consumed");
            self.persist(persistence).await?;
        }
        Ok(())
    }

    async fn persist(&self, persistence: &dyn Persistence) -> Result<(), MeshError> {
        let mut ids: Vec<String> = self.invoked.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        let bytes = rmp_serde::to_vec(&ids).map_err(|e| MeshError::encode("token store", e))?;
        persistence.write_bytes(TOKENS_KEY, &bytes).await
    }

    /// Restore the used-token set written by a previous run.
    pub async fn load(&self, persistence: &dyn Persistence) -> Result<(), MeshError> {
        if let Some(bytes) = persistence.read_bytes(TOKENS_KEY).await? {
            let ids: Vec<String> =
                rmp_serde::from_slice(&bytes).map_err(|e| MeshError::decode("token store", e))?;
            for id in ids {
                self.invoked.insert(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessScope;
    use crate::crypto::Ed25519Signing;
    use crate::storage::memory::MemoryPersistence;
    use crate::testing::CounterEntity;

    struct Fixture {
        manager: TokenManager,
        issuer: EntityId,
        keys: KeyPair,
        target: CounterEntity,
        holder: EntityId,
    }

    fn fixture(single_use: bool) -> Fixture {
        let store = Arc::new(KeyStore::new());
        let issuer = EntityId::from_parts(1, 10);
        let keys = Ed25519Signing.generate_key_pair();
        store.insert(issuer, keys.public.clone());

        let mut target = CounterEntity::new(issuer);
        target.core.id = EntityId::from_parts(1, 500);
        Fixture {
            manager: TokenManager::new(store, Arc::new(Ed25519Signing), single_use),
            issuer,
            keys,
            target,
            holder: EntityId::from_parts(2, 20),
        }
    }

    fn token_for(f: &Fixture) -> TokenBuilder {
        Token::builder()
            .subject(f.target.core.id)
            .audience(f.holder)
            .expires_in(Duration::from_secs(60))
    }

    #[test]
    fn valid_token_passes() {
        let f = fixture(false);
        let token = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();
        f.manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap();
        assert_eq!(token.issuer().unwrap(), f.issuer);
    }

    #[test]
    fn header_round_trip() {
        let f = fixture(false);
        let token = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();
        let parsed = Token::from_header(&token.to_header().unwrap()).unwrap();
        assert_eq!(parsed, token);
        assert!(matches!(
            Token::from_header("{nope"),
            Err(MeshError::TokenInvalid { .. })
        ));
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let f = fixture(false);
        let mut token = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();
        token
            .claims
            .insert(CLAIM_AUDIENCE.to_string(), EntityId::from_parts(3, 3).to_string());
        let err = f
            .manager
            .is_token_valid(&token, &f.target, Some(&EntityId::from_parts(3, 3)))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidSignature));
    }

    #[test]
    fn unknown_issuer_key_fails_signature() {
        let f = fixture(false);
        let stranger = EntityId::from_parts(7, 7);
        let token = token_for(&f).sign(stranger, &Ed25519Signing, &f.keys).unwrap();
        let err = f
            .manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidSignature));
    }

    #[test]
    fn subject_must_match_target() {
        let f = fixture(false);
        let token = Token::builder()
            .subject(EntityId::from_parts(1, 999))
            .audience(f.holder)
            .sign(f.issuer, &Ed25519Signing, &f.keys)
            .unwrap();
        let err = f
            .manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap_err();
        assert!(matches!(err, MeshError::TokenInvalid { reason } if reason.contains("subject")));
    }

    #[test]
    fn audience_must_match_sender() {
        let f = fixture(false);
        let token = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();
        let err = f
            .manager
            .is_token_valid(&token, &f.target, Some(&EntityId::from_parts(5, 5)))
            .unwrap_err();
        assert!(matches!(err, MeshError::TokenInvalid { reason } if reason.contains("audience")));

        let no_audience = Token::builder()
            .sign(f.issuer, &Ed25519Signing, &f.keys)
            .unwrap();
        assert!(f
            .manager
            .is_token_valid(&no_audience, &f.target, Some(&f.holder))
            .is_err());
        f.manager
            .is_token_valid(&no_audience, &f.target, None)
            .unwrap();
    }

    #[test]
    fn issuer_cannot_grant_more_than_it_has() {
        let f = fixture(false);
        let outsider = EntityId::from_parts(4, 4);
        let outsider_keys = Ed25519Signing.generate_key_pair();
        f.manager.keys().insert(outsider, outsider_keys.public.clone());
        let token = token_for(&f)
            .sign(outsider, &Ed25519Signing, &outsider_keys)
            .unwrap();
        let err = f
            .manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap_err();
        assert!(matches!(err, MeshError::TokenInvalid { reason } if reason.contains("no access")));

        let mut open_target = CounterEntity::new(f.issuer);
        open_target.core.id = f.target.core.id;
        open_target
            .core
            .access
            .set_general(AccessScope::Everyone, AccessMode::READ);
        f.manager
            .is_token_valid(&token, &open_target, Some(&f.holder))
            .unwrap();
    }

    #[test]
    fn expired_token_fails() {
        let f = fixture(false);
        let token = Token::builder()
            .audience(f.holder)
            .expires_at(Utc::now() - chrono::Duration::seconds(5))
            .sign(f.issuer, &Ed25519Signing, &f.keys)
            .unwrap();
        let err = f
            .manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap_err();
        assert!(matches!(err, MeshError::TokenInvalid { reason } if reason.contains("expired")));
    }

    #[tokio::test]
    async fn single_use_tokens_are_consumed_and_persisted() {
        let f = fixture(true);
        let store = MemoryPersistence::new();
        let token = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();

        f.manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap();
        f.manager.mark_invoked(&token, &store).await.unwrap();
        assert!(f
            .manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .is_err());

        let restarted = fixture(true);
        restarted.manager.load(&store).await.unwrap();
        restarted.manager.keys().insert(f.issuer, f.keys.public.clone());
        assert!(restarted
            .manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .is_err());
    }

    #[tokio::test]
    async fn reusable_tokens_are_not_tracked() {
        let f = fixture(false);
        let store = MemoryPersistence::new();
        let token = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();
        f.manager.mark_invoked(&token, &store).await.unwrap();
        f.manager
            .is_token_valid(&token, &f.target, Some(&f.holder))
            .unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn scopes_filter_and_authorize() {
        let scopes = ScopesList::default();
        scopes.register(Scope::new("counter.write", &["increment", "setValue"]));
        scopes.register(Scope::new("counter.read", &["get"]));

        let f = fixture(false);
        let token = token_for(&f)
            .scopes(&["counter.read", "unregistered"])
            .sign(f.issuer, &Ed25519Signing, &f.keys)
            .unwrap();
        assert_eq!(token.scopes(), vec!["counter.read", "unregistered"]);
        let granted = scopes.filter(&token.scopes());
        assert_eq!(granted.len(), 1);
        assert!(scopes.authorizes(&token, "get"));
        assert!(!scopes.authorizes(&token, "increment"));

        let unrestricted = token_for(&f).sign(f.issuer, &Ed25519Signing, &f.keys).unwrap();
        assert!(scopes.authorizes(&unrestricted, "increment"));
    }
}
