// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::{error, info};

lazy_static! {
    pub static ref RECEIPTS_TO_COLLECT: IntGaugeVec = register_int_gauge_vec!(
        "receipts_to_collect",
        "Receipts waiting in the current collection batch",
        &["network"]
    )
    .unwrap();
    pub static ref FAILED_RECEIPTS: IntCounterVec = register_int_counter_vec!(
        "failed_receipts",
        "Receipts whose voucher exchange failed",
        &["network"]
    )
    .unwrap();
    pub static ref PARTIAL_VOUCHERS_TO_EXCHANGE: IntGaugeVec = register_int_gauge_vec!(
        "partial_vouchers_to_exchange",
        "Partial vouchers awaiting the final merge",
        &["network"]
    )
    .unwrap();
    pub static ref RECEIPTS_COLLECT_DURATION: HistogramVec = register_histogram_vec!(
        "receipts_collect_duration",
        "Duration of a receipt batch exchange (seconds)",
        &["network"]
    )
    .unwrap();
    pub static ref VOUCHERS: IntCounterVec = register_int_counter_vec!(
        "vouchers",
        "Vouchers obtained from the gateway",
        &["network"]
    )
    .unwrap();
    pub static ref SUCCESS_VOUCHER_REDEEMS: IntCounterVec = register_int_counter_vec!(
        "success_voucher_redeems",
        "Successful on-chain voucher redemptions",
        &["network"]
    )
    .unwrap();
    pub static ref INVALID_VOUCHER_REDEEMS: IntCounterVec = register_int_counter_vec!(
        "invalid_voucher_redeems",
        "Voucher redemptions rejected by the contract (paused or unauthorized)",
        &["network"]
    )
    .unwrap();
    pub static ref FAILED_VOUCHER_REDEEMS: IntCounterVec = register_int_counter_vec!(
        "failed_voucher_redeems",
        "Voucher redemptions that failed to submit",
        &["network"]
    )
    .unwrap();
    pub static ref VOUCHERS_REDEEM_DURATION: HistogramVec = register_histogram_vec!(
        "vouchers_redeem_duration",
        "Duration of a redemption tick (seconds)",
        &["network"]
    )
    .unwrap();
    pub static ref VOUCHERS_BATCH_REDEEM_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "vouchers_batch_redeem_size",
        "Number of vouchers in the most recently submitted redemption batch",
        &["network"]
    )
    .unwrap();
    pub static ref VOUCHER_COLLECTED_FEES: GaugeVec = register_gauge_vec!(
        "voucher_collected_fees",
        "Fee value of the most recently collected voucher",
        &["network", "allocation"]
    )
    .unwrap();
}

async fn metrics_handler() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Serves the process-wide prometheus registry on `0.0.0.0:{port}/metrics`.
pub fn serve_metrics(port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, port, "Failed to bind the metrics listener");
                return;
            }
        };
        info!(port, "Serving metrics");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server terminated");
        }
    })
}
