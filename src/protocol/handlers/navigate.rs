//! Directory and file management handlers.

use log::info;

use super::{HandlerContext, require, resolve};
use crate::error::StorageError;
use crate::error::replies::storage_reply;
use crate::protocol::commands::CommandResult;
use crate::protocol::responses::{
    ACTION_ABORTED, BAD_SEQUENCE, FILE_ACTION_OK, FILE_NOT_FOUND, FILE_STATUS, PATH_CREATED,
    PENDING_FURTHER_INFO, format_reply,
};
use crate::storage::validation::contains_wildcards;

fn no_such_file(path: &str) -> CommandResult {
    CommandResult::failure(format_reply(
        FILE_NOT_FOUND,
        &format!("{path}: No such file or directory"),
    ))
}

/// Handles the PWD command.
pub(super) fn handle_cmd_pwd(ctx: &mut HandlerContext<'_>) -> CommandResult {
    let path = ctx.session.current_path();
    CommandResult::success(format_reply(
        PATH_CREATED,
        &format!("\"{path}\" is current directory"),
    ))
}

/// Handles CWD (and CDUP, which is `CWD ..`).
pub(super) async fn handle_cmd_cwd(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    // 1. Validate the argument
    let path = match require("CWD", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    if contains_wildcards(path) {
        return CommandResult::failure(format_reply(
            ACTION_ABORTED,
            "Wildcards are not allowed in path",
        ));
    }

    // 2. Resolve against the working directory
    let Some((virtual_path, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    // 3. The target must be an existing directory
    match ctx.storage.metadata(&storage_path).await {
        Ok(entry) if entry.is_dir => {
            info!(
                "Client {} changed directory to {}",
                ctx.session.peer_addr(),
                virtual_path
            );
            ctx.session.set_current_path(virtual_path);
            CommandResult::success(format_reply(FILE_ACTION_OK, "CWD command successful"))
        }
        Ok(_) => CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{path}: Not a directory"),
        )),
        Err(e) => CommandResult::failure(storage_reply(&e, path, true)),
    }
}

pub(super) async fn handle_cmd_mkd(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("MKD", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((virtual_path, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.make_dir(&storage_path).await {
        Ok(()) => CommandResult::success(format_reply(
            PATH_CREATED,
            &format!("\"{virtual_path}\" directory created"),
        )),
        Err(e) => CommandResult::failure(storage_reply(&e, path, true)),
    }
}

pub(super) async fn handle_cmd_rmd(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("RMD", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.remove_dir(&storage_path).await {
        Ok(()) => CommandResult::success(format_reply(FILE_ACTION_OK, "RMD command successful")),
        Err(e) => CommandResult::failure(storage_reply(&e, path, true)),
    }
}

pub(super) async fn handle_cmd_dele(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("DELE", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.remove_file(&storage_path).await {
        Ok(()) => CommandResult::success(format_reply(FILE_ACTION_OK, "DELE command successful")),
        Err(e) => CommandResult::failure(storage_reply(&e, path, false)),
    }
}

/// Handles RNFR: remembers the source if it exists.
pub(super) async fn handle_cmd_rnfr(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("RNFR", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.metadata(&storage_path).await {
        Ok(_) => {
            ctx.session.set_rename_from(Some(storage_path));
            CommandResult::success(format_reply(
                PENDING_FURTHER_INFO,
                "File exists, ready for destination name",
            ))
        }
        Err(e) => {
            ctx.session.set_rename_from(None);
            CommandResult::failure(storage_reply(&e, path, false))
        }
    }
}

/// Handles RNTO: completes a rename started with RNFR.
pub(super) async fn handle_cmd_rnto(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("RNTO", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some(from) = ctx.session.take_rename_from() else {
        return CommandResult::failure(format_reply(BAD_SEQUENCE, "Bad sequence of commands"));
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.rename(&from, &storage_path).await {
        Ok(()) => CommandResult::success(format_reply(FILE_ACTION_OK, "RNTO command successful")),
        Err(e) => CommandResult::failure(storage_reply(&e, path, false)),
    }
}

/// Handles SIZE: the stored size of a plain file.
pub(super) async fn handle_cmd_size(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("SIZE", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.metadata(&storage_path).await {
        Ok(entry) if entry.is_dir => CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{path}: {}", StorageError::NotAFile(path.to_string())),
        )),
        Ok(entry) => CommandResult::success(format_reply(FILE_STATUS, &entry.size.to_string())),
        Err(e) => CommandResult::failure(storage_reply(&e, path, false)),
    }
}

pub(super) async fn handle_cmd_mdtm(ctx: &mut HandlerContext<'_>, path: &str) -> CommandResult {
    let path = match require("MDTM", path) {
        Ok(path) => path,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, path) else {
        return no_such_file(path);
    };

    match ctx.storage.metadata(&storage_path).await {
        Ok(entry) => match entry.mdtm() {
            Some(stamp) => CommandResult::success(format_reply(FILE_STATUS, &stamp)),
            None => CommandResult::failure(format_reply(
                FILE_NOT_FOUND,
                &format!("{path}: Modification time not available"),
            )),
        },
        Err(e) => CommandResult::failure(storage_reply(&e, path, false)),
    }
}
