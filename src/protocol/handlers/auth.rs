//! Login and session-setting handlers: `USER`, `PASS`, `FEAT`, `SYST`,
//! `TYPE`, `ALIAS` and `DOMAIN`.

use log::{info, warn};

use super::{HandlerContext, require};
use crate::config::StartupConfig;
use crate::error::replies::auth_reply;
use crate::protocol::commands::CommandResult;
use crate::protocol::responses::{
    BAD_SEQUENCE, FEATURES, FILE_NOT_FOUND, GOODBYE, LOGIN_SUCCESS, NOT_IMPLEMENTED_FOR_PARAM, OK,
    PASSWORD_REQUIRED, SYNTAX_ERROR, SYSTEM_TYPE, format_multiline, format_reply,
};
use crate::session::state::DomainContext;
use crate::storage::validation::resolve_path;
use crate::transfer::modes::TransferType;

/// Handles the USER command: remembers the name until `PASS` arrives.
///
/// The name may carry a domain as `user@domain` or `user-domain`; it is
/// split when the password is checked.
pub(super) fn handle_cmd_user(ctx: &mut HandlerContext<'_>, user: &str) -> CommandResult {
    let user = match require("USER", user) {
        Ok(user) => user,
        Err(result) => return result,
    };

    ctx.session.set_username(Some(user.to_string()));
    CommandResult::success(format_reply(
        PASSWORD_REQUIRED,
        &format!("Password required for {user}"),
    ))
}

/// Handles the PASS command: authenticates the pending user and enters
/// the user's domain.
///
/// The `max_login_attempts`-th failure ends the connection.
pub(super) async fn handle_cmd_pass(ctx: &mut HandlerContext<'_>, password: &str) -> CommandResult {
    let Some(raw_user) = ctx.session.username().map(str::to_string) else {
        return CommandResult::failure(format_reply(BAD_SEQUENCE, "Login with USER first"));
    };
    let (user, explicit_domain) = split_user(&raw_user, ctx.config);

    match ctx.auth.authenticate(&user, password).await {
        Ok(profile) => {
            ctx.session.set_logged_in(true);
            ctx.session.set_username(Some(profile.name.clone()));

            if let Some(name) = explicit_domain.or(profile.domain) {
                match lookup_domain(ctx.config, &name) {
                    Some(domain) => ctx.session.set_domain(Some(domain)),
                    None => warn!(
                        "Client {} asked for unknown domain {}",
                        ctx.session.peer_addr(),
                        name
                    ),
                }
            }

            info!(
                "Client {} logged in as {}",
                ctx.session.peer_addr(),
                profile.name
            );
            CommandResult::success(format_reply(
                LOGIN_SUCCESS,
                &format!("User {} logged in", profile.name),
            ))
        }
        Err(e) => {
            let failures = ctx.session.record_failed_login();
            warn!(
                "Client {} failed to log in as {} ({} attempts): {}",
                ctx.session.peer_addr(),
                user,
                failures,
                e
            );
            if failures >= ctx.config.max_login_attempts {
                let mut reply = auth_reply(&e);
                reply.push_str(&format_reply(GOODBYE, "Goodbye"));
                CommandResult::close(reply)
            } else {
                CommandResult::failure(auth_reply(&e))
            }
        }
    }
}

/// Splits `user@domain`, or `user-domain` when the suffix names a
/// configured domain.
fn split_user(raw: &str, config: &StartupConfig) -> (String, Option<String>) {
    if let Some((user, domain)) = raw.split_once('@') {
        return (user.to_string(), Some(domain.to_string()));
    }
    if let Some((user, domain)) = raw.rsplit_once('-') {
        if find_domain(config, domain).is_some() {
            return (user.to_string(), Some(domain.to_string()));
        }
    }
    (raw.to_string(), None)
}

fn find_domain<'c>(config: &'c StartupConfig, name: &str) -> Option<(&'c str, &'c str)> {
    config
        .domains
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(key, dir)| (key.as_str(), dir.as_str()))
}

/// Looks up `name[user]` in the configured domains.
fn lookup_domain(config: &StartupConfig, value: &str) -> Option<DomainContext> {
    let (name, user) = match value.split_once('[') {
        Some((name, rest)) => (name.trim(), Some(rest.strip_suffix(']')?.trim())),
        None => (value.trim(), None),
    };
    let (key, dir) = find_domain(config, name)?;
    let root = resolve_path("/", dir)?;

    Some(DomainContext {
        name: key.to_string(),
        root,
        user: user.filter(|u| !u.is_empty()).map(str::to_string),
    })
}

/// Handles the FEAT command.
pub(super) fn handle_cmd_feat(ctx: &mut HandlerContext<'_>) -> CommandResult {
    let config = ctx.config;
    let mut features = Vec::new();
    if config.extended {
        features.push("EPRT");
        features.push("EPSV");
    }
    features.push("MDTM");
    if config.passive {
        features.push("PASV");
    }
    if config.rest {
        features.push("REST STREAM");
    }
    features.extend(["SIZE", "UTF8", "MKDIRS", "DATAALIVE", "MD5SUM"]);

    let mut reply = format!("{FEATURES}-Extensions supported:\r\n");
    for feature in features {
        reply.push(' ');
        reply.push_str(feature);
        reply.push_str("\r\n");
    }
    reply.push_str(&format_reply(FEATURES, "End"));
    CommandResult::success(reply)
}

pub(super) fn handle_cmd_syst() -> CommandResult {
    CommandResult::success(format_reply(SYSTEM_TYPE, "UNIX Type: L8"))
}

/// Handles the TYPE command: `A`, `A N`, `I` and `L 8`.
pub(super) fn handle_cmd_type(ctx: &mut HandlerContext<'_>, param: &str) -> CommandResult {
    let param = match require("TYPE", param) {
        Ok(param) => param,
        Err(result) => return result,
    };

    match TransferType::from_param(param) {
        Some(transfer_type) => {
            ctx.session.set_transfer_type(transfer_type);
            CommandResult::success(format_reply(
                OK,
                &format!("Type set to {}", transfer_type.code()),
            ))
        }
        None => CommandResult::failure(format_reply(
            NOT_IMPLEMENTED_FOR_PARAM,
            &format!("Type {param} not implemented"),
        )),
    }
}

/// Handles the ALIAS command.
///
/// * `ALIAS` lists the aliases of the current domain.
/// * `ALIAS src=dst` defines one, `ALIAS src=` removes it.
pub(super) fn handle_cmd_alias(ctx: &mut HandlerContext<'_>, param: &str) -> CommandResult {
    let param = param.trim();
    if param.is_empty() {
        let aliases = ctx.session.aliases();
        if aliases.is_empty() {
            return CommandResult::success(format_reply(OK, "No alias defined"));
        }
        let lines: Vec<String> = aliases
            .iter()
            .map(|(source, target)| format!("{source}={target}"))
            .collect();
        return CommandResult::success(format_multiline(OK, &lines, "End of alias list"));
    }

    let Some((source, target)) = param.split_once('=') else {
        return CommandResult::failure(format_reply(SYNTAX_ERROR, "ALIAS parse error"));
    };
    let (source, target) = (source.trim(), target.trim());
    if source.is_empty() || source.contains(char::is_whitespace) {
        return CommandResult::failure(format_reply(SYNTAX_ERROR, "ALIAS parse error"));
    }

    if target.is_empty() {
        if ctx.session.remove_alias(source) {
            CommandResult::success(format_reply(OK, &format!("Alias {source} removed")))
        } else {
            CommandResult::failure(format_reply(FILE_NOT_FOUND, &format!("Alias {source} not found")))
        }
    } else {
        ctx.session.set_alias(source, target);
        CommandResult::success(format_reply(OK, &format!("Alias {source} set to {target}")))
    }
}

/// Handles the DOMAIN command: `DOMAIN name[user]`, or `DOMAIN /` to go
/// back to the server root.
pub(super) fn handle_cmd_domain(ctx: &mut HandlerContext<'_>, param: &str) -> CommandResult {
    let param = match require("DOMAIN", param) {
        Ok(param) => param,
        Err(result) => return result,
    };

    if param == "/" {
        ctx.session.set_domain(None);
        return CommandResult::success(format_reply(OK, "DOMAIN set to /"));
    }

    match lookup_domain(ctx.config, param) {
        Some(domain) => {
            info!(
                "Client {} switched to domain {}",
                ctx.session.peer_addr(),
                domain.name
            );
            let reply = format_reply(OK, &format!("DOMAIN set to {}", domain.name));
            ctx.session.set_domain(Some(domain));
            CommandResult::success(reply)
        }
        None => CommandResult::failure(format_reply(FILE_NOT_FOUND, "Invalid domain name")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StartupConfig {
        let mut config = StartupConfig::default();
        config.domains.insert("ops".into(), "data/ops".into());
        config
    }

    #[test]
    fn domain_with_user() {
        let domain = lookup_domain(&config(), "OPS[alice]").unwrap();
        assert_eq!(domain.name, "ops");
        assert_eq!(domain.root, "/data/ops");
        assert_eq!(domain.user.as_deref(), Some("alice"));
    }

    #[test]
    fn malformed_or_unknown_domain() {
        assert!(lookup_domain(&config(), "ops[alice").is_none());
        assert!(lookup_domain(&config(), "dev").is_none());
    }

    #[test]
    fn user_suffixes() {
        let config = config();
        assert_eq!(
            split_user("bob@ops", &config),
            ("bob".to_string(), Some("ops".to_string()))
        );
        assert_eq!(
            split_user("bob-ops", &config),
            ("bob".to_string(), Some("ops".to_string()))
        );
        assert_eq!(split_user("data-team", &config), ("data-team".to_string(), None));
    }
}
