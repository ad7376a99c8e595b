use super::{ApiResponse, HttpRequest, HttpResponse};
use crate::flow::{FlowTable, FlowTableError};
use crate::pipeline::{EtherCounts, SharedEtherCounts};
use crate::utils::format_utils::{format_ip, protocol_name};
use flowprobe_common::{FlowRecord, FlowTotals};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// One chain-head record in readable and raw form
#[derive(Serialize, Deserialize)]
pub struct FlowInfo {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub vlan_id: Option<u16>,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub tos_bits: u8,
    pub tcp_flags: u8,
    pub first_seen: u64,
    pub last_seen: u64,
    pub raw: FlowRecord,
}

impl From<&FlowRecord> for FlowInfo {
    fn from(record: &FlowRecord) -> Self {
        Self {
            src_ip: format_ip(&record.ip_src.to_ne_bytes()),
            dst_ip: format_ip(&record.ip_dst.to_ne_bytes()),
            src_port: u16::from_be(record.port_src),
            dst_port: u16::from_be(record.port_dst),
            protocol: protocol_name(record.proto),
            vlan_id: record.vlan_id,
            bytes_sent: record.bytes_sent,
            packets_sent: record.packets_sent,
            tos_bits: record.tos_bits,
            tcp_flags: record.tcp_flags,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            raw: *record,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct FlowsResponse {
    pub n_entries: u32,
    pub total: usize,
    pub flows: Vec<FlowInfo>,
}

#[derive(Serialize, Deserialize)]
pub struct TotalsResponse {
    pub totals: FlowTotals,
    pub frames: EtherCounts,
    pub used_buckets: usize,
    pub records: usize,
    pub longest_chain: usize,
}

/// Read-only view of the flow table
#[derive(Clone)]
pub struct FlowApiHandler {
    table: Arc<FlowTable>,
    counters: Arc<SharedEtherCounts>,
    shutdown: Arc<AtomicBool>,
}

impl FlowApiHandler {
    pub fn new(
        table: Arc<FlowTable>,
        counters: Arc<SharedEtherCounts>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            table,
            counters,
            shutdown,
        }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec!["/api/flows"]
    }

    pub async fn handle_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        if request.method != "GET" {
            return Ok(match request.path.as_str() {
                "/api/flows" | "/api/flows/totals" | "/api/flows/dump" => {
                    HttpResponse::method_not_allowed()
                }
                _ => HttpResponse::not_found(),
            });
        }

        match request.path.as_str() {
            "/api/flows" => self.handle_flows(request).await,
            "/api/flows/totals" => self.handle_totals().await,
            "/api/flows/dump" => self.handle_dump().await,
            _ => Ok(HttpResponse::not_found()),
        }
    }
}

impl FlowApiHandler {
    /// Handle /api/flows, optionally capped by `?limit=N`
    async fn handle_flows(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let limit = match request.query_params.get("limit") {
            Some(value) => match value.parse::<usize>() {
                Ok(limit) => Some(limit),
                Err(_) => {
                    return Ok(HttpResponse::error(
                        400,
                        format!("Invalid limit '{}'", value),
                    ))
                }
            },
            None => None,
        };

        let table = Arc::clone(&self.table);
        let shutdown = Arc::clone(&self.shutdown);
        let walk =
            tokio::task::spawn_blocking(move || table.snapshot_interruptible(&shutdown)).await?;
        let records = match walk {
            Ok(records) => records,
            Err(e) => return Ok(unavailable(e)),
        };

        let total = records.len();
        let flows = records
            .iter()
            .take(limit.unwrap_or(total))
            .map(FlowInfo::from)
            .collect();

        let response = FlowsResponse {
            n_entries: self.table.capacity(),
            total,
            flows,
        };
        let body = serde_json::to_string(&ApiResponse::success(response))?;
        Ok(HttpResponse::ok(body))
    }

    /// Handle /api/flows/totals
    async fn handle_totals(&self) -> Result<HttpResponse, anyhow::Error> {
        let table = Arc::clone(&self.table);
        let shutdown = Arc::clone(&self.shutdown);
        let walk = tokio::task::spawn_blocking(move || {
            let totals = table.aggregate_totals_interruptible(&shutdown)?;
            let occupancy = table.occupancy_interruptible(&shutdown)?;
            Ok::<_, FlowTableError>((totals, occupancy))
        })
        .await?;

        let (totals, occupancy) = match walk {
            Ok(result) => result,
            Err(e) => return Ok(unavailable(e)),
        };

        let response = TotalsResponse {
            totals,
            frames: self.counters.load(),
            used_buckets: occupancy.used_buckets,
            records: occupancy.records,
            longest_chain: occupancy.longest_chain,
        };
        let body = serde_json::to_string(&ApiResponse::success(response))?;
        Ok(HttpResponse::ok(body))
    }

    /// Handle /api/flows/dump, the plain-text table dump
    async fn handle_dump(&self) -> Result<HttpResponse, anyhow::Error> {
        let table = Arc::clone(&self.table);
        let shutdown = Arc::clone(&self.shutdown);
        let walk =
            tokio::task::spawn_blocking(move || table.snapshot_dump_interruptible(&shutdown))
                .await?;
        match walk {
            Ok(dump) => Ok(HttpResponse::text(dump)),
            Err(e) => Ok(unavailable(e)),
        }
    }
}

fn unavailable(e: FlowTableError) -> HttpResponse {
    HttpResponse::error(503, e.to_string())
}
