use crate::command::{Command, CommandContext};
use crate::entity::Entity;
use crate::envelope::TOKEN_HEADER_KEY;
use crate::error::MeshError;
use crate::permission::Permission;
use crate::token::Token;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Fallback hops after which resolution assumes a cycle and gives up.
const MAX_FALLBACK_HOPS: usize = 100;

/// Slug to command map with an optional fallback controller.
///
/// Controllers are built up front and shared behind an `Arc` afterwards, so
/// registration needs `&mut self` and lookups are lock-free.
#[derive(Default)]
pub struct CommandController {
    commands: HashMap<String, Arc<dyn Command>>,
    fallback: Option<Arc<CommandController>>,
}

impl CommandController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Arc<CommandController>) -> Self {
        Self {
            commands: HashMap::new(),
            fallback: Some(fallback),
        }
    }

    pub fn set_fallback(&mut self, fallback: Option<Arc<CommandController>>) {
        self.fallback = fallback;
    }

    pub fn register(&mut self, command: impl Command) -> Result<(), MeshError> {
        self.register_arc(Arc::new(command))
    }

    pub fn register_arc(&mut self, command: Arc<dyn Command>) -> Result<(), MeshError> {
        let slug = command.slug().to_string();
        if self.commands.contains_key(&slug) {
            return Err(MeshError::AlreadyRegistered { slug });
        }
        self.commands.insert(slug, command);
        Ok(())
    }

    /// Replace whatever is registered under `slug`.
    pub fn overwrite(&mut self, slug: &str, command: Arc<dyn Command>) {
        self.commands.insert(slug.to_string(), command);
    }

    /// Slugs registered directly on this controller, sorted.
    pub fn slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }

    /// Find `slug` here or anywhere down the fallback chain.
    pub fn resolve(&self, slug: &str) -> Result<Arc<dyn Command>, MeshError> {
        let mut current = self;
        let mut hops = 0;
        loop {
            if let Some(command) = current.commands.get(slug) {
                return Ok(Arc::clone(command));
            }
            let Some(next) = current.fallback.as_deref() else {
                break;
            };
            hops += 1;
            if hops > MAX_FALLBACK_HOPS {
                warn!(
                    slug,
                    hops, "fallback chain exceeded hop limit, likely a cycle"
                );
                break;
            }
            current = next;
        }
        Err(MeshError::UnknownCommand {
            slug: slug.to_string(),
            target: None,
        })
    }

    /// Check every permission of `command`, then execute it against `target`.
    ///
    /// A failing permission may still be satisfied by a delegation token in
    /// the envelope header; only that permission is re-checked as the token's
    /// issuer. A single-use token is consumed once all permissions pass.
    #[instrument(skip_all, fields(slug = %ctx.envelope.slug, sender = %ctx.envelope.sender_id, target = %target.id()))]
    pub async fn dispatch(
        &self,
        ctx: &CommandContext<'_>,
        command: &dyn Command,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        let sender = ctx.sender();
        let mut delegated = None;
        for permission in &command.settings().permissions {
            if permission.check(ctx, target, &sender) {
                continue;
            }
            delegated = Some(self.delegate(ctx, permission.as_ref(), target)?);
        }
        if let Some(token) = delegated {
            ctx.node
                .tokens()
                .mark_invoked(&token, ctx.node.persistence().as_ref())
                .await?;
        }
        ctx.node.metrics().commands_dispatched.inc();
        command.execute(ctx, target).await
    }

    /// Execute without permission checks. Used for writes replayed from the
    /// managing node, which already authorized them.
    pub async fn dispatch_trusted(
        &self,
        ctx: &CommandContext<'_>,
        command: &dyn Command,
        target: &mut dyn Entity,
    ) -> Result<Vec<u8>, MeshError> {
        ctx.node.metrics().commands_dispatched.inc();
        command.execute(ctx, target).await
    }

    /// Satisfy `permission` with the envelope's token. Returns the token so
    /// the caller can consume it.
    fn delegate(
        &self,
        ctx: &CommandContext<'_>,
        permission: &dyn Permission,
        target: &dyn Entity,
    ) -> Result<Token, MeshError> {
        let envelope = ctx.envelope;
        let not_met = || MeshError::PermissionNotMet {
            permission: permission.name().to_string(),
            target: target.id(),
            sender: envelope.sender_id,
            command: envelope.slug.clone(),
        };
        let Some(raw) = envelope.headers.get(TOKEN_HEADER_KEY) else {
            return Err(not_met());
        };
        let token = Token::from_header(raw)?;
        let tokens = ctx.node.tokens();
        tokens.is_token_valid(&token, target, Some(&envelope.sender_id))?;
        if !tokens.scopes().authorizes(&token, &envelope.slug) {
            return Err(MeshError::TokenInvalid {
                reason: format!("no granted scope covers `{}`", envelope.slug),
            });
        }
        let issuer = token.issuer()?;
        if !permission.check(ctx, target, &issuer) {
            debug!(permission = permission.name(), %issuer, "token issuer lacks permission");
            return Err(not_met());
        }
        debug!(permission = permission.name(), %issuer, "permission satisfied by token");
        Ok(token)
    }
}
