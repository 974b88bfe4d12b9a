//! Command handlers module
//!
//! Dispatches parsed commands to their handlers after the session-wide
//! gates: login state, disabled extensions and connection-ending commands.

mod auth;
mod navigate;
mod opts;
mod transfer;

use log::{debug, warn};

use crate::auth::Authenticator;
use crate::config::{SharedRuntimeConfig, StartupConfig};
use crate::protocol::commands::{Command, CommandResult};
use crate::protocol::responses::{GOODBYE, NOT_LOGGED_IN, OK, SYNTAX_ERROR, format_reply, not_understood};
use crate::session::registry::ServerStats;
use crate::session::reply::ReplyWriter;
use crate::session::state::Session;
use crate::storage::FileSystem;
use crate::storage::validation::resolve_path;

/// Everything a handler may touch while executing one command.
pub struct HandlerContext<'a> {
    pub session: &'a mut Session,
    /// Control writer for intermediate (`150`) replies.
    pub replies: &'a mut ReplyWriter,
    pub config: &'a StartupConfig,
    pub runtime: &'a SharedRuntimeConfig,
    pub storage: &'a dyn FileSystem,
    pub auth: &'a dyn Authenticator,
    pub stats: &'a ServerStats,
}

/// Dispatches a received FTP command to its corresponding handler.
///
/// # Arguments
///
/// * `ctx` - Session, control writer and server services.
/// * `command` - The parsed command, after alias and `SITE` expansion.
///
/// # Returns
///
/// * `CommandResult` - Status of the command and the final reply to send.
pub async fn handle_command(ctx: &mut HandlerContext<'_>, command: Command) -> CommandResult {
    // 1. Commands that always end the session
    if matches!(command, Command::QUIT | Command::ABOR) {
        return CommandResult::close(format_reply(GOODBYE, "Goodbye"));
    }

    // 2. A second login on the same connection
    if matches!(command, Command::USER(_) | Command::PASS(_)) && ctx.session.is_logged_in() {
        return CommandResult::failure(format_reply(NOT_LOGGED_IN, "Already logged in"));
    }

    // 3. Authentication gate
    if !ctx.session.is_logged_in() && !command.allowed_before_login() {
        debug!(
            "Client {} sent {} before logging in",
            ctx.session.peer_addr(),
            command.verb()
        );
        return CommandResult::failure(format_reply(NOT_LOGGED_IN, "Not logged in"));
    }

    // 4. Extensions switched off in the configuration
    if is_disabled(ctx.config, &command) {
        return CommandResult::failure(not_understood(&command.to_string()));
    }

    match command {
        Command::USER(user) => auth::handle_cmd_user(ctx, &user),
        Command::PASS(password) => auth::handle_cmd_pass(ctx, &password).await,
        Command::FEAT => auth::handle_cmd_feat(ctx),
        Command::SYST => auth::handle_cmd_syst(),
        Command::TYPE(param) => auth::handle_cmd_type(ctx, &param),
        Command::ALIAS(param) => auth::handle_cmd_alias(ctx, &param),
        Command::DOMAIN(param) => auth::handle_cmd_domain(ctx, &param),
        Command::PWD => navigate::handle_cmd_pwd(ctx),
        Command::CWD(path) => navigate::handle_cmd_cwd(ctx, &path).await,
        Command::CDUP => navigate::handle_cmd_cwd(ctx, "..").await,
        Command::MKD(path) => navigate::handle_cmd_mkd(ctx, &path).await,
        Command::RMD(path) => navigate::handle_cmd_rmd(ctx, &path).await,
        Command::DELE(path) => navigate::handle_cmd_dele(ctx, &path).await,
        Command::RNFR(path) => navigate::handle_cmd_rnfr(ctx, &path).await,
        Command::RNTO(path) => navigate::handle_cmd_rnto(ctx, &path).await,
        Command::SIZE(path) => navigate::handle_cmd_size(ctx, &path).await,
        Command::MDTM(path) => navigate::handle_cmd_mdtm(ctx, &path).await,
        Command::NOOP => CommandResult::success(format_reply(OK, "NOOP command successful")),
        Command::REST(param) => transfer::handle_cmd_rest(ctx, &param),
        Command::PASV => transfer::handle_cmd_pasv(ctx, false).await,
        Command::EPSV => transfer::handle_cmd_pasv(ctx, true).await,
        Command::PORT(param) => transfer::handle_cmd_port(ctx, &param).await,
        Command::EPRT(param) => transfer::handle_cmd_eprt(ctx, &param).await,
        Command::RETR(path) => transfer::handle_cmd_retr(ctx, &path).await,
        Command::STOR(path) => transfer::handle_cmd_stor(ctx, &path, false).await,
        Command::APPE(path) => transfer::handle_cmd_stor(ctx, &path, true).await,
        Command::LIST(param) => transfer::handle_cmd_list(ctx, &param, false).await,
        Command::NLST(param) => transfer::handle_cmd_list(ctx, &param, true).await,
        Command::OPTS(opts) => opts::handle_cmd_opts(ctx, opts).await,
        // SITE is unwrapped by the session loop; only an empty one gets here.
        Command::SITE(_) => missing_parameter("SITE"),
        Command::UNKNOWN(verb) => {
            warn!("Client {} sent unknown command {}", ctx.session.peer_addr(), verb);
            CommandResult::failure(not_understood(&verb))
        }
        Command::QUIT | Command::ABOR => CommandResult::close(format_reply(GOODBYE, "Goodbye")),
    }
}

fn is_disabled(config: &StartupConfig, command: &Command) -> bool {
    match command {
        Command::EPSV | Command::EPRT(_) => !config.extended,
        Command::PASV => !config.passive,
        Command::REST(_) => !config.rest,
        _ => false,
    }
}

fn missing_parameter(verb: &str) -> CommandResult {
    CommandResult::failure(format_reply(SYNTAX_ERROR, &format!("{verb} parse error")))
}

/// Returns the trimmed parameter, or the `501` result when it is empty.
fn require<'p>(verb: &str, param: &'p str) -> Result<&'p str, CommandResult> {
    let param = param.trim();
    if param.is_empty() {
        Err(missing_parameter(verb))
    } else {
        Ok(param)
    }
}

/// Resolves a client path into `(virtual path, storage path)` for the
/// session's current domain and working directory.
fn resolve(session: &Session, target: &str) -> Option<(String, String)> {
    let virtual_path = resolve_path(&session.current_path(), target)?;
    let storage_path = session.storage_path(&virtual_path);
    Some((virtual_path, storage_path))
}
