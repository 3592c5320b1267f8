//! The demo's service logic: dispatch loop plus a handful of opcodes that
//! exercise each capability of the endpoint (payload echo, fd push, channel
//! push, impulses).

use std::io::{IoSlice, IoSliceMut};
use std::path::Path;

use uidomain_endpoint::{Endpoint, Message, CHANNEL_CLOSE, CHANNEL_OPEN};

/// Echoes the request payload back unchanged.
pub const OP_ECHO: i32 = 42;
/// Pushes a duplicated fd to `/dev/null` back to the caller.
pub const OP_PUSH_FD: i32 = 43;
/// Opens a brand-new channel and pushes it back to the caller.
pub const OP_PUSH_CHANNEL: i32 = 44;

pub fn run(socket_path: &Path) -> anyhow::Result<()> {
    let endpoint = Endpoint::bind(socket_path, true)?;
    log::info!("listening on {}", socket_path.display());

    loop {
        let message = match endpoint.message_receive() {
            Ok(message) => message,
            Err(uidomain_endpoint::Error::Shutdown) => {
                log::info!("endpoint shut down, exiting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if message.is_impulse {
            log::info!(
                "impulse from channel {} op {}: {:?}",
                message.cid,
                message.op,
                message.impulse_payload
            );
            continue;
        }

        dispatch(&endpoint, message)?;
    }
}

fn dispatch(endpoint: &Endpoint, message: Message) -> anyhow::Result<()> {
    match message.op {
        CHANNEL_OPEN => {
            log::debug!("channel {} opened, pid {}", message.cid, message.credentials.pid);
            endpoint.message_reply(message, 0)?;
        }
        CHANNEL_CLOSE => {
            log::debug!("channel {} closed", message.cid);
            endpoint.message_reply(message, 0)?;
        }
        OP_ECHO => echo(endpoint, message)?,
        OP_PUSH_FD => push_fd(endpoint, message)?,
        OP_PUSH_CHANNEL => push_channel(endpoint, message)?,
        other => {
            log::warn!("unknown opcode {other} on channel {}", message.cid);
            endpoint.message_reply(message, -1)?;
        }
    }
    Ok(())
}

fn echo(endpoint: &Endpoint, mut message: Message) -> anyhow::Result<()> {
    let len = message.state.request_len();
    let mut buf = vec![0u8; len];
    {
        let mut iov = [IoSliceMut::new(&mut buf)];
        message.state.read_message_data(&mut iov);
    }
    {
        let iov = [IoSlice::new(&buf)];
        message.state.write_message_data(&iov);
    }
    endpoint.message_reply(message, 0)?;
    Ok(())
}

fn push_fd(endpoint: &Endpoint, message: Message) -> anyhow::Result<()> {
    let devnull = std::fs::File::open("/dev/null")?;
    endpoint.message_reply_fd(message, devnull.into())?;
    Ok(())
}

fn push_channel(endpoint: &Endpoint, mut message: Message) -> anyhow::Result<()> {
    let reference = endpoint.push_channel(&mut message, 0)?;
    endpoint.message_reply(message, reference.raw())?;
    Ok(())
}
