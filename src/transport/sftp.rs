//! File transfer over the SSH sftp subsystem.

use std::collections::HashMap;

use log::debug;
use russh::client::Handle;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::ssh::SshHandler;
use crate::error::{Result, TransportError};

/// Open an sftp session on a fresh channel of `handle`.
async fn open(handle: &Handle<SshHandler>) -> Result<SftpSession> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(TransportError::Ssh)?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(TransportError::Ssh)?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|err| TransportError::Sftp(err.to_string()).into())
}

/// Fetch each path into memory.
pub(crate) async fn download(
    handle: &Handle<SshHandler>,
    paths: &[String],
) -> Result<HashMap<String, Vec<u8>>> {
    let sftp = open(handle).await?;
    let mut files = HashMap::with_capacity(paths.len());
    for path in paths {
        let mut file = sftp
            .open(path)
            .await
            .map_err(|err| TransportError::Sftp(format!("{}: {}", path, err)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|err| TransportError::Sftp(format!("{}: {}", path, err)))?;
        debug!("downloaded {} ({} bytes)", path, data.len());
        files.insert(path.clone(), data);
    }
    let _ = sftp.close().await;
    Ok(files)
}

/// Store each entry at its remote path.
pub(crate) async fn upload(
    handle: &Handle<SshHandler>,
    files: &HashMap<String, Vec<u8>>,
) -> Result<()> {
    let sftp = open(handle).await?;
    for (path, data) in files {
        let mut file = sftp
            .create(path)
            .await
            .map_err(|err| TransportError::Sftp(format!("{}: {}", path, err)))?;
        file.write_all(data)
            .await
            .map_err(|err| TransportError::Sftp(format!("{}: {}", path, err)))?;
        file.shutdown()
            .await
            .map_err(|err| TransportError::Sftp(format!("{}: {}", path, err)))?;
        debug!("uploaded {} ({} bytes)", path, data.len());
    }
    let _ = sftp.close().await;
    Ok(())
}
