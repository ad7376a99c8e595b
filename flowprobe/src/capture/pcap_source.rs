use super::{Burst, CaptureSpec, PacketSource, SourceError};
use log::{info, warn};
use pcap::{Activated, Capture, Linktype};

/// libpcap knobs shared by every live queue
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub promisc: bool,
    pub snaplen: i32,
    pub buffer_size: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            promisc: true,
            snaplen: 65535,
            buffer_size: 4 * 1024 * 1024,
        }
    }
}

struct Queue {
    name: String,
    capture: Capture<dyn Activated>,
    offline: bool,
    exhausted: bool,
}

/// Receive queues backed by libpcap handles, one per capture spec.
///
/// Live handles are non-blocking so a poll returns whatever is buffered.
/// File handles replay a savefile and report exhaustion at its end.
pub struct PcapSource {
    queues: Vec<Queue>,
}

impl PcapSource {
    pub fn open(specs: &[CaptureSpec], config: &CaptureConfig) -> Result<Self, SourceError> {
        let mut queues = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.to_string();
            let (capture, offline) = match spec {
                CaptureSpec::Live(iface) => (open_live(iface, config), false),
                CaptureSpec::File(path) => (
                    Capture::from_file(path).map(Capture::<dyn Activated>::from),
                    true,
                ),
            };
            let capture = capture.map_err(|source| SourceError::Open {
                queue: name.clone(),
                source,
            })?;

            let linktype = capture.get_datalink();
            if linktype != Linktype::ETHERNET {
                warn!(
                    "{} has link type {:?}, frames are parsed as Ethernet",
                    name, linktype
                );
            }
            info!("Opened capture queue {}", name);

            queues.push(Queue {
                name,
                capture,
                offline,
                exhausted: false,
            });
        }
        Ok(Self { queues })
    }
}

fn open_live(iface: &str, config: &CaptureConfig) -> Result<Capture<dyn Activated>, pcap::Error> {
    let capture = Capture::from_device(iface)?
        .promisc(config.promisc)
        .snaplen(config.snaplen)
        .buffer_size(config.buffer_size)
        .immediate_mode(true)
        .open()?
        .setnonblock()?;
    Ok(capture.into())
}

impl PacketSource for PcapSource {
    fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn queue_name(&self, queue: usize) -> &str {
        self.queues
            .get(queue)
            .map(|q| q.name.as_str())
            .unwrap_or("?")
    }

    fn rx_burst(&mut self, queue: usize, burst: &mut Burst) -> Result<usize, SourceError> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or(SourceError::NoSuchQueue(queue))?;
        if q.exhausted {
            return Ok(0);
        }

        let mut received = 0;
        while !burst.is_full() {
            match q.capture.next_packet() {
                Ok(packet) => {
                    burst.push(packet.data);
                    received += 1;
                }
                Err(pcap::Error::TimeoutExpired) => break,
                Err(pcap::Error::NoMorePackets) => {
                    if q.offline {
                        info!("{} reached end of capture", q.name);
                        q.exhausted = true;
                    }
                    break;
                }
                Err(source) => {
                    return Err(SourceError::Receive {
                        queue: q.name.clone(),
                        source,
                    })
                }
            }
        }
        Ok(received)
    }

    fn is_exhausted(&self) -> bool {
        !self.queues.is_empty() && self.queues.iter().all(|q| q.offline && q.exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::extract::testing::Ipv4Spec;
    use pcap::{Packet, PacketHeader};
    use std::path::PathBuf;

    fn write_savefile(name: &str, frames: &[Vec<u8>]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "flowprobe-{}-{}.pcap",
            name,
            std::process::id()
        ));
        let dead = Capture::dead(Linktype::ETHERNET).unwrap();
        let mut save = dead.savefile(&path).unwrap();
        for frame in frames {
            let header = PacketHeader {
                ts: libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                },
                caplen: frame.len() as u32,
                len: frame.len() as u32,
            };
            save.write(&Packet::new(&header, frame));
        }
        save.flush().unwrap();
        path
    }

    #[test]
    fn test_offline_replay_fills_bursts_then_exhausts() {
        let frames: Vec<Vec<u8>> = (0..40u8)
            .map(|n| Ipv4Spec::udp([10, 0, 0, n], [10, 0, 1, 1], 53, 53).frame())
            .collect();
        let path = write_savefile("replay", &frames);

        let specs = [CaptureSpec::File(path.clone())];
        let mut source = PcapSource::open(&specs, &CaptureConfig::default()).unwrap();
        assert_eq!(source.queue_count(), 1);
        assert!(source.queue_name(0).starts_with("file:"));

        let mut burst = Burst::default();
        assert_eq!(source.rx_burst(0, &mut burst).unwrap(), 32);
        assert_eq!(burst.frames()[0], frames[0]);
        burst.release();

        // a short read stops at end of file
        assert_eq!(source.rx_burst(0, &mut burst).unwrap(), 8);
        assert!(source.is_exhausted());
        burst.release();

        assert_eq!(source.rx_burst(0, &mut burst).unwrap(), 0);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file_reports_queue() {
        let err = PcapSource::open(
            &[CaptureSpec::File(PathBuf::from("/nonexistent/flowprobe.pcap"))],
            &CaptureConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SourceError::Open { ref queue, .. } if queue.contains("flowprobe.pcap")
        ));
    }

    #[test]
    fn test_unknown_queue_is_an_error() {
        let mut source = PcapSource { queues: Vec::new() };
        let mut burst = Burst::default();
        assert!(matches!(
            source.rx_burst(3, &mut burst),
            Err(SourceError::NoSuchQueue(3))
        ));
        assert!(!source.is_exhausted());
    }
}
