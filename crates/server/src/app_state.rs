use server_api::ApiContext;
use shared::protocol::ChangeEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub api: ApiContext,
    pub events: broadcast::Sender<ChangeEvent>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(api: ApiContext, api_key: Option<String>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            api,
            events,
            api_key,
        }
    }
}
