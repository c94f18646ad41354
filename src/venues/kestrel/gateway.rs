// src/venues/kestrel/gateway.rs
//
// Kestrel order gateway. Order entry on this venue runs through the paper
// simulator: NEWs are acknowledged and filled on the internal timer queue,
// CANCELs always succeed. The run loop is the single producer of the
// response ring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::PaperTradingConfig;
use crate::runtime::ShutdownFlag;
use crate::spsc::{Consumer, Producer};
use crate::types::{
    ClientId, ClientRequest, ClientRequestKind, ClientResponse, TickerId,
};
use crate::venues::paper::PaperEngine;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Default)]
struct SymbolMap {
    ticker_to_symbol: HashMap<TickerId, String>,
    symbol_to_ticker: HashMap<String, TickerId>,
}

pub struct KestrelOrderGateway {
    client_id: ClientId,
    symbols: Arc<Mutex<SymbolMap>>,
    paper: PaperEngine,
}

impl KestrelOrderGateway {
    pub fn new(client_id: ClientId, paper_cfg: PaperTradingConfig) -> Self {
        Self {
            client_id,
            symbols: Arc::new(Mutex::new(SymbolMap::default())),
            paper: PaperEngine::new(paper_cfg),
        }
    }

    #[cfg(test)]
    pub fn with_seed(client_id: ClientId, paper_cfg: PaperTradingConfig, seed: u64) -> Self {
        Self {
            client_id,
            symbols: Arc::new(Mutex::new(SymbolMap::default())),
            paper: PaperEngine::with_seed(paper_cfg, seed),
        }
    }

    /// Register a tradable instrument in both directions.
    pub fn register_instrument(&self, venue_symbol: &str, ticker_id: TickerId) {
        let mut map = self.symbols.lock().unwrap();
        map.ticker_to_symbol
            .insert(ticker_id, venue_symbol.to_string());
        map.symbol_to_ticker
            .insert(venue_symbol.to_string(), ticker_id);
        info!(symbol = venue_symbol, ticker_id, "instrument registered");
    }

    pub fn symbol_for(&self, ticker_id: TickerId) -> Option<String> {
        self.symbols
            .lock()
            .unwrap()
            .ticker_to_symbol
            .get(&ticker_id)
            .cloned()
    }

    pub fn ticker_for(&self, venue_symbol: &str) -> Option<TickerId> {
        self.symbols
            .lock()
            .unwrap()
            .symbol_to_ticker
            .get(venue_symbol)
            .copied()
    }

    /// Gateway run loop: drains the request ring, dispatches to the paper
    /// simulator and emits due fills.
    pub async fn run(
        mut self,
        mut requests: Consumer<ClientRequest>,
        mut responses: Producer<ClientResponse>,
        shutdown: ShutdownFlag,
    ) {
        info!(client_id = self.client_id, "kestrel order gateway started");
        while !shutdown.is_requested() {
            let mut made_progress = false;

            while let Some(request) = requests.pop() {
                made_progress = true;
                if request.client_id != self.client_id {
                    warn!(
                        got = request.client_id,
                        expected = self.client_id,
                        "request for wrong client id"
                    );
                    continue;
                }
                let response = self.process_request(&request, Instant::now());
                emit(&mut responses, response);
            }

            for fill in self.paper.pop_due(Instant::now()) {
                made_progress = true;
                emit(&mut responses, fill);
            }

            if !made_progress {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
        info!(client_id = self.client_id, "kestrel order gateway stopped");
    }

    fn process_request(&mut self, request: &ClientRequest, now: Instant) -> ClientResponse {
        match request.kind {
            ClientRequestKind::New => {
                info!(%request, "paper new order");
                self.paper.on_new(request, now)
            }
            ClientRequestKind::Cancel => {
                info!(%request, "paper cancel");
                self.paper.on_cancel(request)
            }
        }
    }
}

fn emit(responses: &mut Producer<ClientResponse>, response: ClientResponse) {
    if responses.push(response).is_err() {
        warn!("response queue full, dropping response");
    }
}
