use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framepipe_frame::{FrameConfig, FrameError, FramedMessageReader};
use framepipe_pipe::Configuration;
use framepipe_transport::{IpcStream, UnixDomainSocket};
use tracing::{debug, info, warn};

use crate::cmd::ListenArgs;
use crate::exit::{frame_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

// Lets the read loop notice Ctrl-C between messages.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, config: &Configuration, format: OutputFormat) -> CliResult<i32> {
    let listener =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %listener.path().display(), "listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let frame_config = FrameConfig {
        max_payload_size: config.max_message_num_bytes,
        read_timeout: Some(POLL_INTERVAL),
        write_timeout: None,
    };

    let mut printed = 0u64;

    while running.load(Ordering::SeqCst) {
        let stream = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        let peer = peer_label(&stream);
        debug!(%peer, "peer connected");

        let mut reader = FramedMessageReader::with_config_ipc(stream, frame_config.clone())
            .map_err(|err| frame_error("stream setup failed", err))?;

        while running.load(Ordering::SeqCst) {
            let payload = match reader.next_message() {
                Ok(payload) => payload,
                Err(FrameError::WouldBlock) => continue,
                Err(FrameError::ConnectionClosed) => {
                    debug!(%peer, "peer disconnected");
                    break;
                }
                Err(err @ FrameError::InvalidMessageSize { .. }) => {
                    warn!(%peer, %err, "dropping peer after malformed frame");
                    break;
                }
                Err(err) => return Err(frame_error("receive failed", err)),
            };

            printed = printed.saturating_add(1);
            print_message(&payload, printed, &peer, format);

            if let Some(count) = args.count {
                if printed >= count as u64 {
                    return Ok(SUCCESS);
                }
            }
        }
    }

    Ok(SUCCESS)
}

fn peer_label(stream: &IpcStream) -> String {
    match stream.peer_credentials() {
        Some((uid, _gid, pid)) => format!("pid:{pid}/uid:{uid}"),
        None => "unknown".to_string(),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
