//! Data channel setup and the data-bearing commands.

use log::{error, info, warn};

use super::{HandlerContext, require, resolve};
use crate::error::TransferError;
use crate::error::replies::{storage_reply, transfer_reply};
use crate::protocol::address::{ExtendedAddress, HostPort};
use crate::protocol::commands::CommandResult;
use crate::protocol::responses::{
    ACTION_ABORTED, EXTENDED_PASSIVE_MODE, FILE_NOT_FOUND, GOODBYE, OK, OPENING_DATA, PASSIVE_MODE,
    PENDING_FURTHER_INFO, SYNTAX_ERROR, TRANSFER_COMPLETE, format_reply,
};
use crate::transfer::file_ops::{TransferOptions, TransferReport, receive_file, send_file, send_listing};
use crate::transfer::operations::{open_data_socket, setup_active_mode, setup_passive_mode};

/// Handles the REST command: the offset applies to the next RETR/STOR.
pub(super) fn handle_cmd_rest(ctx: &mut HandlerContext<'_>, param: &str) -> CommandResult {
    let param = match require("REST", param) {
        Ok(param) => param,
        Err(result) => return result,
    };

    match param.parse::<u64>() {
        Ok(offset) => {
            ctx.session.set_rest_offset(offset);
            CommandResult::success(format_reply(
                PENDING_FURTHER_INFO,
                &format!("Restarting at {offset}. Send STORE or RETRIEVE to initiate transfer"),
            ))
        }
        Err(_) => CommandResult::failure(format_reply(
            SYNTAX_ERROR,
            "REST requires a value greater than or equal to 0",
        )),
    }
}

/// Handles PASV and EPSV: binds a listener and advertises it.
pub(super) async fn handle_cmd_pasv(ctx: &mut HandlerContext<'_>, extended: bool) -> CommandResult {
    match setup_passive_mode(ctx.session, ctx.config, extended).await {
        Ok(text) => {
            let code = if extended { EXTENDED_PASSIVE_MODE } else { PASSIVE_MODE };
            CommandResult::success(format_reply(code, &text))
        }
        Err(e) => {
            error!(
                "Failed to set up passive mode for client {}: {}",
                ctx.session.peer_addr(),
                e
            );
            CommandResult::failure(transfer_reply(&e, ""))
        }
    }
}

/// Handles the PORT command: `h1,h2,h3,h4,p1,p2`.
pub(super) async fn handle_cmd_port(ctx: &mut HandlerContext<'_>, param: &str) -> CommandResult {
    let param = match require("PORT", param) {
        Ok(param) => param,
        Err(result) => return result,
    };
    let address = match param.parse::<HostPort>() {
        Ok(address) => address,
        Err(e) => {
            warn!("Client {} sent a bad PORT: {}", ctx.session.peer_addr(), e);
            return CommandResult::failure(format_reply(SYNTAX_ERROR, "Illegal PORT command"));
        }
    };

    match setup_active_mode(ctx.session, ctx.config, address.socket_addr(), false).await {
        Ok(()) => CommandResult::success(format_reply(OK, "PORT command successful")),
        Err(e) => CommandResult::failure(transfer_reply(&e, "")),
    }
}

/// Handles the EPRT command: `|proto|ip|port|`.
pub(super) async fn handle_cmd_eprt(ctx: &mut HandlerContext<'_>, param: &str) -> CommandResult {
    let param = match require("EPRT", param) {
        Ok(param) => param,
        Err(result) => return result,
    };
    let address = match param.parse::<ExtendedAddress>() {
        Ok(address) => address,
        Err(e) => {
            warn!("Client {} sent a bad EPRT: {}", ctx.session.peer_addr(), e);
            return CommandResult::failure(format_reply(SYNTAX_ERROR, "Illegal EPRT command"));
        }
    };

    match setup_active_mode(ctx.session, ctx.config, address.0, true).await {
        Ok(()) => CommandResult::success(format_reply(OK, "EPRT command successful")),
        Err(e) => CommandResult::failure(transfer_reply(&e, "")),
    }
}

fn transfer_options(ctx: &HandlerContext<'_>, max_size: Option<u64>) -> TransferOptions {
    TransferOptions {
        buffer_size: ctx.session.buffer_size(),
        checksum: ctx.session.checksum().enabled,
        max_size,
    }
}

/// Sends the `150` preliminary reply. A failure here means the control
/// connection is gone.
async fn announce(ctx: &mut HandlerContext<'_>, text: &str) -> Result<(), CommandResult> {
    ctx.replies.reply(OPENING_DATA, text).await.map_err(|e| {
        error!(
            "Failed to send preliminary reply to client {}: {}",
            ctx.session.peer_addr(),
            e
        );
        CommandResult::close(format_reply(GOODBYE, "Goodbye"))
    })
}

/// Common tail of every transfer: keeps or drops the data socket and
/// turns the outcome into the final reply.
async fn finish_transfer(
    ctx: &mut HandlerContext<'_>,
    outcome: Result<TransferReport, TransferError>,
    path: &str,
    upload: bool,
) -> CommandResult {
    match outcome {
        Ok(report) => {
            if upload {
                ctx.stats.record_received(report.bytes);
            } else {
                ctx.stats.record_sent(report.bytes);
            }
            if let Some(digest) = report.digest {
                ctx.session.checksum_mut().last = Some(digest);
            }
            ctx.session.release_data_channel(false).await;
            CommandResult::success(format_reply(TRANSFER_COMPLETE, "Transfer complete"))
        }
        Err(e) => {
            error!(
                "Transfer of {} failed for client {}: {}",
                path,
                ctx.session.peer_addr(),
                e
            );
            ctx.stats.record_failure();
            ctx.session.release_data_channel(true).await;
            CommandResult::failure(transfer_reply(&e, path))
        }
    }
}

/// Handles the RETR command.
///
/// The resume offset is consumed first, whatever the outcome.
pub(super) async fn handle_cmd_retr(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    // 1. Consume the resume offset
    let offset = ctx.session.take_rest_offset();

    // 2. Resolve the file
    let path = match require("RETR", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{path}: No such file or directory"),
        ));
    };
    let entry = match ctx.storage.metadata(&storage_path).await {
        Ok(entry) => entry,
        Err(e) => return CommandResult::failure(storage_reply(&e, path, false)),
    };
    if entry.is_dir {
        return CommandResult::failure(format_reply(
            ACTION_ABORTED,
            &format!("{path}: Not a plain file"),
        ));
    }
    if offset > entry.size {
        return CommandResult::failure(format_reply(
            ACTION_ABORTED,
            &format!("{path}: Restart offset {offset} is beyond the end of the file"),
        ));
    }

    // 3. Open the file at the offset
    let source = match ctx.storage.open_read(&storage_path, offset).await {
        Ok(source) => source,
        Err(e) => return CommandResult::failure(storage_reply(&e, path, false)),
    };
    let expected = entry.size - offset;
    let transfer_type = ctx.session.transfer_type();

    // 4. Preliminary reply, then the data socket
    let text = format!("{transfer_type} mode connection for {path} ({expected} bytes)");
    if let Err(result) = announce(ctx, &text).await {
        return result;
    }
    let options = transfer_options(ctx, None);
    let outcome = match open_data_socket(ctx.session, ctx.config).await {
        Ok(socket) => send_file(socket, source, transfer_type, expected, &options).await,
        Err(e) => Err(e),
    };

    if outcome.is_ok() {
        info!(
            "Client {} downloaded {} from offset {}",
            ctx.session.peer_addr(),
            path,
            offset
        );
    }
    finish_transfer(ctx, outcome, path, false).await
}

/// Handles STOR and APPE.
pub(super) async fn handle_cmd_stor(
    ctx: &mut HandlerContext<'_>,
    path: &str,
    append: bool,
) -> CommandResult {
    let verb = if append { "APPE" } else { "STOR" };

    // 1. Consume the resume offset
    let offset = ctx.session.take_rest_offset();

    // 2. Open the destination
    let path = match require(verb, path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{path}: No such file or directory"),
        ));
    };
    let sink = match ctx
        .storage
        .open_write(&storage_path, offset, append, ctx.session.mkdirs())
        .await
    {
        Ok(sink) => sink,
        Err(e) => return CommandResult::failure(storage_reply(&e, path, false)),
    };
    let transfer_type = ctx.session.transfer_type();

    // 3. Preliminary reply, then the data socket
    let text = format!("File status okay; about to open {transfer_type} mode data connection");
    if let Err(result) = announce(ctx, &text).await {
        return result;
    }
    let max_size = ctx.runtime.read().await.max_file_size_bytes();
    let options = transfer_options(ctx, Some(max_size));
    let outcome = match open_data_socket(ctx.session, ctx.config).await {
        Ok(socket) => receive_file(socket, sink, transfer_type, &options).await,
        Err(e) => Err(e),
    };

    if outcome.is_ok() {
        info!("Client {} uploaded {} ({})", ctx.session.peer_addr(), path, verb);
    }
    finish_transfer(ctx, outcome, path, true).await
}

/// Handles LIST and NLST. `ls` style options (`-l`, `-a`) are ignored.
pub(super) async fn handle_cmd_list(
    ctx: &mut HandlerContext<'_>,
    param: &str,
    names_only: bool,
) -> CommandResult {
    let target = param
        .split_whitespace()
        .filter(|token| !token.starts_with('-'))
        .collect::<Vec<_>>()
        .join(" ");
    let shown = if target.is_empty() { "." } else { target.as_str() };

    let Some((_, storage_path)) = resolve(ctx.session, &target) else {
        return CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{shown}: No such file or directory"),
        ));
    };
    let entries = match ctx.storage.list(&storage_path).await {
        Ok(entries) => entries,
        Err(e) => return CommandResult::failure(storage_reply(&e, shown, false)),
    };
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| {
            if names_only {
                entry.name.clone()
            } else {
                entry.long_listing()
            }
        })
        .collect();
    let transfer_type = ctx.session.transfer_type();

    if let Err(result) = announce(ctx, &format!("Opening {transfer_type} mode data connection")).await {
        return result;
    }
    let outcome = match open_data_socket(ctx.session, ctx.config).await {
        Ok(socket) => send_listing(socket, &lines, transfer_type.line_ending())
            .await
            .map(|bytes| TransferReport { bytes, digest: None }),
        Err(e) => Err(e),
    };
    finish_transfer(ctx, outcome, shown, false).await
}
