use std::error::Error;

use brightbase_realtime::auth::AuthTokenStore;
use brightbase_realtime::config::RealtimeConfig;
use brightbase_realtime::realtime::client::RealtimeClient;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let connection_hash = "REPLACE_WITH_CONNECTION_HASH".to_string();
    let channel_name = "dashboard/REPLACE_WITH_REALTIME_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let auth = AuthTokenStore::new();
        auth.set_token(Some(SecretString::new(
            "REPLACE_WITH_AUTH_TOKEN".to_string(),
        )));

        let config = RealtimeConfig::new(SecretString::new(connection_hash));
        let client = RealtimeClient::new(config, auth);

        let Some(subscription) = client.subscribe(&channel_name).await? else {
            println!("realtime is disabled; nothing to subscribe to");
            return Ok(());
        };
        println!("subscribed channel={}", subscription.channel_name());

        let mut events = subscription.take_events().expect("first receiver");
        while let Some(event) = events.recv().await {
            println!("action={} payload={}", event.action.as_str(), event.payload);
        }

        client.unsubscribe(Some(&subscription));
        client.reset();
        Ok::<(), Box<dyn Error>>(())
    })
}
