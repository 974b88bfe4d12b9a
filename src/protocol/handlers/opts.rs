//! `OPTS` vendor extensions.

use log::{debug, info};
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use super::{HandlerContext, require, resolve};
use crate::error::StorageError;
use crate::error::replies::storage_reply;
use crate::protocol::commands::{CommandResult, OptsCommand};
use crate::protocol::responses::{
    FILE_NOT_FOUND, NOT_IMPLEMENTED_FOR_PARAM, OK, SYNTAX_ERROR, format_reply,
};
use crate::storage::FileSystem;

pub(super) async fn handle_cmd_opts(ctx: &mut HandlerContext<'_>, opts: OptsCommand) -> CommandResult {
    debug!("Client {} OPTS {}", ctx.session.peer_addr(), opts);

    match opts {
        OptsCommand::Md5Sum => {
            ctx.session.checksum_mut().enabled = true;
            CommandResult::success(format_reply(OK, "MD5SUM enabled"))
        }
        OptsCommand::Md5Set(value) => handle_md5_set(ctx, &value),
        OptsCommand::Md5Dump(file) => handle_md5_dump(ctx, &file).await,
        OptsCommand::InputFilters(filters) => handle_filters("RCOMP", &filters),
        OptsCommand::OutputFilters(filters) => handle_filters("SCOMP", &filters),
        OptsCommand::Ptcp(count) => handle_ptcp(&count),
        OptsCommand::PShared => CommandResult::failure(format_reply(
            NOT_IMPLEMENTED_FOR_PARAM,
            "Shared passive socket not available",
        )),
        OptsCommand::DataAlive => {
            ctx.session.set_data_alive(true);
            info!("Client {} enabled data-alive mode", ctx.session.peer_addr());
            CommandResult::success(format_reply(OK, "DATAALIVE enabled"))
        }
        OptsCommand::Empty(file) => handle_empty(ctx, &file).await,
        OptsCommand::Mkdirs => {
            ctx.session.set_mkdirs(true);
            CommandResult::success(format_reply(OK, "MKDIRS enabled"))
        }
        OptsCommand::Utf8(_) => CommandResult::success(format_reply(OK, "UTF8 set to on")),
        OptsCommand::Unknown(option) => CommandResult::failure(format_reply(
            SYNTAX_ERROR,
            &format!("Option not understood: {option}"),
        )),
    }
}

fn handle_md5_set(ctx: &mut HandlerContext<'_>, value: &str) -> CommandResult {
    let value = match require("MD5SET", value) {
        Ok(value) => value,
        Err(result) => return result,
    };
    match hex::decode(value) {
        Ok(bytes) if bytes.len() == 16 => {
            ctx.session.checksum_mut().expected = Some(value.to_ascii_lowercase());
            CommandResult::success(format_reply(OK, "MD5SET accepted"))
        }
        _ => CommandResult::failure(format_reply(
            SYNTAX_ERROR,
            &format!("Invalid MD5 checksum: {value}"),
        )),
    }
}

/// Records the checksum of `file` and reports it.
///
/// The value comes from `MD5SET` if one is pending, else from the last
/// digested transfer, else it is computed from the stored file.
async fn handle_md5_dump(ctx: &mut HandlerContext<'_>, file: &str) -> CommandResult {
    let file = match require("MD5DUMP", file) {
        Ok(file) => file,
        Err(result) => return result,
    };
    let Some((virtual_path, storage_path)) = resolve(ctx.session, file) else {
        return CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{file}: No such file or directory"),
        ));
    };

    let checksum = ctx.session.checksum_mut();
    let known = checksum.expected.take().or_else(|| checksum.last.take());
    let digest = match known {
        Some(digest) => digest,
        None => match digest_file(ctx.storage, ctx.session.buffer_size(), &storage_path).await {
            Ok(digest) => digest,
            Err(e) => return CommandResult::failure(storage_reply(&e, file, false)),
        },
    };

    ctx.session
        .checksum_mut()
        .recorded
        .insert(virtual_path, digest.clone());
    CommandResult::success(format_reply(OK, &format!("{digest} {file}")))
}

async fn digest_file(
    storage: &dyn FileSystem,
    buffer_size: usize,
    storage_path: &str,
) -> Result<String, StorageError> {
    let mut source = storage.open_read(storage_path, 0).await?;
    let mut buffer = vec![0u8; buffer_size];
    let mut digest = Md5::new();
    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        digest.update(&buffer[..n]);
    }
    Ok(hex::encode(digest.finalize()))
}

/// Only the identity filter is available.
fn handle_filters(name: &str, filters: &str) -> CommandResult {
    let filters = filters.trim();
    if filters.is_empty() || filters.eq_ignore_ascii_case("none") {
        CommandResult::success(format_reply(OK, &format!("{name} set to none")))
    } else {
        CommandResult::failure(format_reply(
            NOT_IMPLEMENTED_FOR_PARAM,
            &format!("Filter(s) not supported: {filters}"),
        ))
    }
}

/// A single stream is all this server transports.
fn handle_ptcp(count: &str) -> CommandResult {
    match count.trim().parse::<u32>() {
        Ok(n) if n <= 1 => CommandResult::success(format_reply(OK, "PTCP single stream")),
        Ok(n) => CommandResult::failure(format_reply(
            NOT_IMPLEMENTED_FOR_PARAM,
            &format!("Multi-stream transport not available ({n} streams)"),
        )),
        Err(_) => CommandResult::failure(format_reply(SYNTAX_ERROR, "PTCP parse error")),
    }
}

async fn handle_empty(ctx: &mut HandlerContext<'_>, file: &str) -> CommandResult {
    let file = match require("EMPTY", file) {
        Ok(file) => file,
        Err(result) => return result,
    };
    let Some((_, storage_path)) = resolve(ctx.session, file) else {
        return CommandResult::failure(format_reply(
            FILE_NOT_FOUND,
            &format!("{file}: No such file or directory"),
        ));
    };

    match ctx.storage.create_empty(&storage_path).await {
        Ok(()) => CommandResult::success(format_reply(OK, &format!("{file} emptied"))),
        Err(e) => CommandResult::failure(storage_reply(&e, file, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::CommandStatus;

    #[test]
    fn ptcp_accepts_a_single_stream_only() {
        assert_eq!(handle_ptcp("1").status, CommandStatus::Success);
        assert!(handle_ptcp("4").message.unwrap().starts_with("504 "));
        assert!(handle_ptcp("x").message.unwrap().starts_with("501 "));
    }

    #[test]
    fn only_identity_filters() {
        assert_eq!(handle_filters("RCOMP", "none").status, CommandStatus::Success);
        assert!(handle_filters("SCOMP", "gzip").message.unwrap().starts_with("504 "));
    }
}
