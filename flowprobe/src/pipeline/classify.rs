use super::counters::EtherCounts;
use crate::flow::{FlowTable, FlowTableError, Ipv4View};
use flowprobe_common::{ETHER_TYPE_ARP, ETHER_TYPE_IPV4, ETHER_TYPE_IPV6, ETHER_TYPE_VLAN};
use network_types::eth::EthHdr;

/// How many packets ahead of the one being classified get prefetched
pub const PREFETCH_OFFSET: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherKind {
    Arp,
    Ipv4,
    Ipv6,
    Vlan,
    Unknown(u16),
    /// Shorter than an Ethernet header
    Runt,
}

impl EtherKind {
    pub fn of(frame: &[u8]) -> Self {
        if frame.len() < EthHdr::LEN {
            return EtherKind::Runt;
        }
        match u16::from_be_bytes([frame[12], frame[13]]) {
            ETHER_TYPE_ARP => EtherKind::Arp,
            ETHER_TYPE_IPV4 => EtherKind::Ipv4,
            ETHER_TYPE_IPV6 => EtherKind::Ipv6,
            ETHER_TYPE_VLAN => EtherKind::Vlan,
            other => EtherKind::Unknown(other),
        }
    }
}

/// Route one frame into the table and report its ether type. Only untagged
/// IPv4 is accounted.
///
/// Frames that fail the length checks are dropped here; the only error
/// returned is the table's record allocation failure.
pub fn classify_packet(table: &FlowTable, frame: &[u8]) -> Result<EtherKind, FlowTableError> {
    let kind = EtherKind::of(frame);
    match kind {
        EtherKind::Ipv4 => process_ipv4(table, frame, false)?,
        // Recognised but not routed anywhere yet
        EtherKind::Arp | EtherKind::Ipv6 | EtherKind::Vlan => {}
        EtherKind::Unknown(_) | EtherKind::Runt => {}
    }
    Ok(kind)
}

fn process_ipv4(table: &FlowTable, frame: &[u8], vlan: bool) -> Result<(), FlowTableError> {
    let ip = match Ipv4View::from_frame(frame, vlan) {
        Ok(ip) => ip,
        Err(e) => {
            log::debug!("Dropping IPv4 frame: {}", e);
            return Ok(());
        }
    };
    let key = match ip.flow_key() {
        Ok(key) => key,
        Err(e) => {
            log::debug!("Dropping IPv4 frame without full transport header: {}", e);
            return Ok(());
        }
    };
    table.upsert(&key, &ip)
}

/// Classify a burst in order, keeping [`PREFETCH_OFFSET`] packets in flight.
/// Every handled frame is tallied into `counts`.
pub fn classify_burst<P: AsRef<[u8]>>(
    table: &FlowTable,
    packets: &[P],
    counts: &mut EtherCounts,
) -> Result<(), FlowTableError> {
    dispatch_prefetched(
        packets,
        |p| prefetch(p.as_ref()),
        |p| {
            counts.record(classify_packet(table, p.as_ref())?);
            Ok(())
        },
    )
}

/// Software pipeline: warm the first packets, then prefetch `j + OFFSET`
/// before handling `j`, then drain the tail without prefetching.
pub fn dispatch_prefetched<T, E>(
    items: &[T],
    mut prefetch: impl FnMut(&T),
    mut handle: impl FnMut(&T) -> Result<(), E>,
) -> Result<(), E> {
    for item in items.iter().take(PREFETCH_OFFSET) {
        prefetch(item);
    }

    let mut j = 0;
    while j + PREFETCH_OFFSET < items.len() {
        prefetch(&items[j + PREFETCH_OFFSET]);
        handle(&items[j])?;
        j += 1;
    }

    for item in &items[j..] {
        handle(item)?;
    }
    Ok(())
}

#[inline(always)]
fn prefetch(data: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        // SAFETY: prefetch is a hint and never faults; SSE is baseline on x86_64
        unsafe { _mm_prefetch::<_MM_HINT_T0>(data.as_ptr() as *const i8) };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = data;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::clock::testing::TickClock;
    use crate::flow::extract::testing::{arp_frame, ipv6_frame, ne_addr, Ipv4Spec};
    use flowprobe_common::FlowTotals;
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Eq)]
    enum Step {
        Prefetch(usize),
        Handle(usize),
    }

    fn schedule(n: usize) -> Vec<Step> {
        let items: Vec<usize> = (0..n).collect();
        let steps = std::cell::RefCell::new(Vec::new());
        dispatch_prefetched::<_, ()>(
            &items,
            |i| steps.borrow_mut().push(Step::Prefetch(*i)),
            |i| {
                steps.borrow_mut().push(Step::Handle(*i));
                Ok(())
            },
        )
        .unwrap();
        steps.into_inner()
    }

    fn table(capacity: u32) -> FlowTable {
        FlowTable::create_with_clock(capacity, 0, Arc::new(TickClock::starting_at(0))).unwrap()
    }

    #[test]
    fn test_prefetch_schedule() {
        use Step::*;
        assert_eq!(
            schedule(5),
            vec![
                Prefetch(0),
                Prefetch(1),
                Prefetch(2),
                Prefetch(3),
                Handle(0),
                Prefetch(4),
                Handle(1),
                Handle(2),
                Handle(3),
                Handle(4),
            ]
        );
        assert_eq!(
            schedule(3),
            vec![
                Prefetch(0),
                Prefetch(1),
                Prefetch(2),
                Handle(0),
                Handle(1),
                Handle(2)
            ]
        );
        assert_eq!(
            schedule(2),
            vec![Prefetch(0), Prefetch(1), Handle(0), Handle(1)]
        );
        assert!(schedule(0).is_empty());
    }

    #[test]
    fn test_every_packet_handled_once_in_order() {
        for n in 0..=32 {
            let handled: Vec<usize> = schedule(n)
                .into_iter()
                .filter_map(|s| match s {
                    Step::Handle(i) => Some(i),
                    Step::Prefetch(_) => None,
                })
                .collect();
            assert_eq!(handled, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_ether_kind() {
        assert_eq!(EtherKind::of(&arp_frame()), EtherKind::Arp);
        assert_eq!(EtherKind::of(&ipv6_frame()), EtherKind::Ipv6);
        let v4 = Ipv4Spec::tcp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2);
        assert_eq!(EtherKind::of(&v4.frame()), EtherKind::Ipv4);
        assert_eq!(EtherKind::of(&v4.tagged_frame(7)), EtherKind::Vlan);

        let mut lldp = arp_frame();
        lldp[12..14].copy_from_slice(&0x88ccu16.to_be_bytes());
        assert_eq!(EtherKind::of(&lldp), EtherKind::Unknown(0x88cc));
        assert_eq!(EtherKind::of(&[0u8; 13]), EtherKind::Runt);
    }

    #[test]
    fn test_non_ipv4_packets_are_noops() {
        let table = table(1024);
        let burst = vec![
            arp_frame(),
            ipv6_frame(),
            arp_frame(),
            ipv6_frame(),
            Ipv4Spec::tcp([10, 0, 0, 1], [10, 0, 0, 2], 1, 2).tagged_frame(20),
            vec![0u8; 6],
        ];
        let mut counts = EtherCounts::default();
        classify_burst(&table, &burst, &mut counts).unwrap();
        assert_eq!(table.aggregate_totals(), FlowTotals::default());
        assert!(table.snapshot().is_empty());
        assert_eq!(
            counts,
            EtherCounts {
                arp: 2,
                ipv4: 0,
                ipv6: 2,
                vlan: 1,
                unknown: 1,
            }
        );
    }

    #[test]
    fn test_handler_error_stops_the_burst() {
        let items: Vec<usize> = (0..6).collect();
        let mut handled = Vec::new();
        let result = dispatch_prefetched(
            &items,
            |_| {},
            |i| {
                handled.push(*i);
                if *i == 1 {
                    Err(*i)
                } else {
                    Ok(())
                }
            },
        );
        assert_eq!(result, Err(1));
        assert_eq!(handled, vec![0, 1]);
    }

    #[test]
    fn test_truncated_ipv4_is_dropped_without_stopping_burst() {
        let table = table(1024);
        let good = Ipv4Spec::udp([10, 0, 0, 1], [10, 0, 0, 2], 5555, 53).length(50);
        let full = good.frame();
        let burst = vec![full.clone(), full[..20].to_vec(), full[..36].to_vec(), full];
        let mut counts = EtherCounts::default();
        classify_burst(&table, &burst, &mut counts).unwrap();
        // Dropped frames are still counted by ether type
        assert_eq!(counts.ipv4, 4);

        let totals = table.aggregate_totals();
        assert_eq!(totals.total_packets_sent, 2);
        assert_eq!(totals.total_bytes_sent, 100);
    }

    #[test]
    fn test_burst_matches_sequential_classification() {
        let frames: Vec<Vec<u8>> = (0..32u8)
            .map(|n| {
                if n % 5 == 0 {
                    arp_frame()
                } else {
                    Ipv4Spec::tcp([10, 0, n % 4, 1], [10, 0, 0, n % 3], 1000 + n as u16, 80)
                        .length(40 + n as u16)
                        .flags(1 << (n % 6))
                        .frame()
                }
            })
            .collect();

        let pipelined = table(64);
        classify_burst(&pipelined, &frames, &mut EtherCounts::default()).unwrap();

        let sequential = table(64);
        for frame in &frames {
            classify_packet(&sequential, frame).unwrap();
        }

        assert_eq!(pipelined.snapshot(), sequential.snapshot());
        assert_eq!(pipelined.aggregate_totals(), sequential.aggregate_totals());
    }

    #[test]
    fn test_ipv4_burst_reaches_table() {
        let table = table(1024);
        let burst: Vec<Vec<u8>> = (0..32)
            .map(|_| {
                Ipv4Spec::tcp([192, 168, 1, 10], [192, 168, 1, 1], 50000, 443)
                    .length(1500)
                    .frame()
            })
            .collect();
        classify_burst(&table, &burst, &mut EtherCounts::default()).unwrap();

        let heads = table.snapshot();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].ip_src, ne_addr([192, 168, 1, 10]));
        assert_eq!(heads[0].packets_sent, 32);
        assert_eq!(heads[0].bytes_sent, 32 * 1500);
    }
}
