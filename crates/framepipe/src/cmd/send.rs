use std::fs;

use framepipe_frame::{FrameConfig, FrameWriter};
use framepipe_pipe::Configuration;
use framepipe_transport::UnixDomainSocket;
use tracing::debug;

use crate::cmd::SendArgs;
use crate::exit::{frame_error, io_error, transport_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: SendArgs, config: &Configuration) -> CliResult<i32> {
    if args.repeat == 0 {
        return Err(CliError::new(USAGE, "--repeat must be at least 1"));
    }
    let payload = resolve_payload(&args)?;
    if payload.is_empty() {
        return Err(CliError::new(
            USAGE,
            "payload must not be empty (zero-length frames are not representable)",
        ));
    }

    let stream = UnixDomainSocket::connect(&args.path)
        .map_err(|err| transport_error("connect failed", err))?;
    let frame_config = FrameConfig {
        max_payload_size: config.max_message_num_bytes,
        ..FrameConfig::default()
    };
    let mut writer = FrameWriter::with_config_ipc(stream, frame_config)
        .map_err(|err| frame_error("stream setup failed", err))?;

    for _ in 0..args.repeat {
        writer
            .send(&payload)
            .map_err(|err| frame_error("send failed", err))?;
    }
    writer
        .flush()
        .map_err(|err| frame_error("flush failed", err))?;
    debug!(count = args.repeat, size = payload.len(), "sent");

    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn args() -> SendArgs {
        SendArgs {
            path: PathBuf::from("/tmp/unused.sock"),
            json: None,
            data: None,
            file: None,
            repeat: 1,
        }
    }

    #[test]
    fn json_payload_is_validated() {
        let bad = SendArgs {
            json: Some("{nope".to_string()),
            ..args()
        };
        assert_eq!(resolve_payload(&bad).unwrap_err().code, USAGE);

        let good = SendArgs {
            json: Some(r#"{"ok":true}"#.to_string()),
            ..args()
        };
        assert_eq!(resolve_payload(&good).unwrap(), br#"{"ok":true}"#);
    }

    #[test]
    fn empty_payload_is_refused_before_connecting() {
        let err = run(args(), &Configuration::default()).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn zero_repeat_is_refused() {
        let zero = SendArgs {
            data: Some("x".to_string()),
            repeat: 0,
            ..args()
        };
        assert_eq!(run(zero, &Configuration::default()).unwrap_err().code, USAGE);
    }
}
