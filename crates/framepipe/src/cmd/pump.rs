use std::thread;
use std::time::Instant;

use framepipe_pipe::{
    Configuration, Consumer, DataPipe, DataPipeOptions, PipeError, Producer, Transfer,
};
use tracing::{debug, info};

use crate::cmd::PumpArgs;
use crate::exit::{pipe_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_pump_report, OutputFormat, PumpReport};

pub fn run(args: PumpArgs, config: &Configuration, format: OutputFormat) -> CliResult<i32> {
    let options = DataPipeOptions::new(args.element_size, args.capacity);
    let (producer, consumer) =
        DataPipe::create(options, config).map_err(|err| pipe_error("create failed", err))?;

    let element = producer.element_num_bytes();
    if args.bytes % element as u64 != 0 {
        return Err(CliError::new(
            USAGE,
            format!("--bytes must be a multiple of the element size ({element})"),
        ));
    }
    let chunk = (args.chunk / element).max(1) * element;
    let capacity = producer.capacity_num_bytes();
    info!(bytes = args.bytes, element, capacity, chunk, two_phase = args.two_phase, "pumping");

    let total = args.bytes;
    let two_phase = args.two_phase;
    let started = Instant::now();
    let writer = thread::Builder::new()
        .name("framepipe-pump".to_string())
        .spawn(move || produce(producer, total, chunk, two_phase))
        .map_err(|err| CliError::new(INTERNAL, format!("spawn failed: {err}")))?;

    let consumed = consume(consumer, total, chunk, two_phase);
    let produced = writer
        .join()
        .map_err(|_| CliError::new(INTERNAL, "producer thread panicked"))?;
    produced.map_err(|err| pipe_error("write failed", err))?;
    let checksum_ok = consumed.map_err(|err| pipe_error("read failed", err))?;

    let elapsed = started.elapsed();
    let report = PumpReport {
        bytes: total,
        element_size: element,
        capacity,
        two_phase,
        elapsed_ms: elapsed.as_millis() as u64,
        throughput_mib_s: total as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(1e-9),
        checksum_ok,
    };
    print_pump_report(&report, format);

    if checksum_ok {
        Ok(SUCCESS)
    } else {
        Ok(DATA_INVALID)
    }
}

fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn fill_pattern(buf: &mut [u8], offset: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = pattern_byte(offset + i as u64);
    }
}

fn matches_pattern(buf: &[u8], offset: u64) -> bool {
    buf.iter()
        .enumerate()
        .all(|(i, byte)| *byte == pattern_byte(offset + i as u64))
}

fn produce(
    mut producer: Producer,
    total: u64,
    chunk: usize,
    two_phase: bool,
) -> Result<u64, PipeError> {
    let mut sent = 0u64;
    let mut buf = vec![0u8; chunk];

    while sent < total {
        let want = chunk.min((total - sent) as usize);
        let step = if two_phase {
            match producer.begin_write(want) {
                Ok(region) => {
                    let len = region.len();
                    fill_pattern(region, sent);
                    producer.end_write(len).map(|()| len)
                }
                Err(err) => Err(err),
            }
        } else {
            fill_pattern(&mut buf[..want], sent);
            producer.write(&buf[..want], Transfer::BestEffort)
        };

        match step {
            Ok(len) => sent += len as u64,
            Err(PipeError::ShouldWait) => thread::yield_now(),
            Err(err) => return Err(err),
        }
    }

    producer.close();
    debug!(sent, "producer done");
    Ok(sent)
}

fn consume(
    mut consumer: Consumer,
    total: u64,
    chunk: usize,
    two_phase: bool,
) -> Result<bool, PipeError> {
    let mut received = 0u64;
    let mut intact = true;
    let mut buf = vec![0u8; chunk];

    while received < total {
        let step = if two_phase {
            match consumer.begin_read() {
                Ok(region) => {
                    let len = region.len();
                    let ok = matches_pattern(region, received);
                    consumer.end_read(len).map(|()| (len, ok))
                }
                Err(err) => Err(err),
            }
        } else {
            consumer
                .read(&mut buf, Transfer::BestEffort)
                .map(|len| (len, matches_pattern(&buf[..len], received)))
        };

        match step {
            Ok((len, ok)) => {
                intact &= ok;
                received += len as u64;
            }
            Err(PipeError::ShouldWait) => thread::yield_now(),
            Err(err) => return Err(err),
        }
    }

    debug!(received, intact, "consumer done");
    Ok(intact)
}
