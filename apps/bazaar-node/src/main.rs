use anyhow::Context;
use bazaar_sync::{
    ConversationSession, ConversationSummary, ItemId, MemoryBackend, Message, MessageKind,
    OfferResponse, SidebarAggregator, SyncConfig, UserId,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay a buyer/seller negotiation against the in-memory backend", long_about = None)]
struct Args {
    /// JSON config file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Price the buyer offers, in major units
    #[arg(short, long, default_value = "15000")]
    price: f64,

    /// Title of the item being negotiated
    #[arg(short = 't', long, default_value = "Road bike")]
    item_title: String,

    /// Seller declines instead of accepting
    #[arg(long)]
    decline: bool,

    /// Make linking the offer message fail once
    #[arg(long)]
    fail_link: bool,

    /// Print the seller's conversation list as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
        .try_init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };

    let server = MemoryBackend::new(config.clone());
    let buyer = UserId::from("buyer");
    let seller = UserId::from("seller");
    let item = ItemId::from("item-1");
    server.register_profile(&buyer, "Buyer", None);
    server.register_profile(&seller, "Seller", None);

    let mut sidebar = SidebarAggregator::new(
        Arc::new(server.client(Some(seller.clone()))),
        config.clone(),
    );
    sidebar.load().await?;
    sidebar.subscribe()?;
    wait_for_subscribers(&server, 1).await;

    let conversation = server.open_conversation(&item, &buyer, &seller);
    println!("Conversation {} about {}", conversation.id, args.item_title);

    let buyer_session = ConversationSession::new(
        Arc::new(server.client(Some(buyer.clone()))),
        conversation.id.clone(),
        item.clone(),
        config.clone(),
    );
    let seller_session = ConversationSession::new(
        Arc::new(server.client(Some(seller.clone()))),
        conversation.id.clone(),
        item,
        config.clone(),
    );
    buyer_session.fetch_initial().await?;
    seller_session.fetch_initial().await?;
    let mut buyer_feed = buyer_session.listen()?;
    let mut seller_feed = seller_session.listen()?;
    wait_for_subscribers(&server, 3).await;

    buyer_session
        .send_inquiry_with_text(&args.item_title)
        .await
        .context("Failed to send inquiry")?;

    if args.fail_link {
        server.fail_after(bazaar_sync::Operation::CreateMessage, 1);
    }
    let expires_at = chrono::Utc::now() + chrono::Duration::minutes(30);
    let (text, offer) = futures::join!(
        buyer_session.send_text("Would you take this?"),
        buyer_session.make_offer(args.price, Some(expires_at)),
    );
    if let Err(e) = text {
        warn!("Text message failed: {}", e);
    }

    match offer {
        Ok(message) => {
            info!("Offer message {} confirmed", message.id);
            tokio::time::sleep(Duration::from_millis(100)).await;
            let response = if args.decline {
                OfferResponse::Declined
            } else {
                OfferResponse::Accepted
            };
            if let Some(offer_id) = message.offer_id.as_ref().and_then(|id| id.confirmed()) {
                seller_session
                    .respond_to_offer(offer_id, response)
                    .await
                    .context("Failed to respond to offer")?;
            }
        }
        Err(e) => {
            warn!("Offer failed: {}", e);
            println!("Offer failed: {}", e);
            for orphan in server.offers() {
                println!("Unlinked offer left on server: {} ({:?})", orphan.id, orphan.status);
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("\n-- buyer timeline --");
    print_timeline(&buyer_session.messages(), &config);
    println!("\n-- seller timeline --");
    print_timeline(&seller_session.messages(), &config);

    println!("\n-- seller conversations --");
    print_sidebar(&sidebar.entries(), args.json)?;

    sidebar.mark_read(&conversation.id).await?;
    println!("\n-- seller conversations after reading --");
    print_sidebar(&sidebar.entries(), args.json)?;

    buyer_feed.unsubscribe();
    seller_feed.unsubscribe();
    sidebar.unsubscribe();
    Ok(())
}

/// `RUST_LOG` directives when set and valid, `info` otherwise
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn print_timeline(messages: &[Message], config: &SyncConfig) {
    let now = chrono::Utc::now();
    for message in messages {
        let time = message.created_at.format("%H:%M:%S%.3f");
        match message.kind {
            MessageKind::Offer => match &message.offer {
                Some(offer) => println!(
                    "{} {} offered {} {} [{:?}, {:?}]",
                    time,
                    message.sender_id,
                    offer.price_minor_units,
                    offer.currency,
                    offer.status,
                    offer.expiry_hint(now, config.expiring_soon_window()),
                ),
                None => println!("{} {} offered (details unavailable)", time, message.sender_id),
            },
            MessageKind::ItemInquiry => println!("{} {} [item card]", time, message.sender_id),
            MessageKind::Text => println!(
                "{} {}: {}",
                time,
                message.sender_id,
                message.body.as_deref().unwrap_or_default()
            ),
        }
    }
}

fn print_sidebar(entries: &[ConversationSummary], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    for entry in entries {
        let preview = entry
            .last_message
            .as_ref()
            .and_then(|p| p.body.as_deref())
            .unwrap_or("");
        println!(
            "{} with {} ({} unread): {}",
            entry.conversation_id, entry.peer_id, entry.unread_count, preview
        );
    }
    Ok(())
}

async fn wait_for_subscribers(server: &MemoryBackend, count: usize) {
    for _ in 0..100 {
        if server.subscriber_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    warn!("Only {} feed subscribers connected", server.subscriber_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_log_filter_defaults_to_info() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_log_filter_honours_directives() {
        assert_eq!(log_filter(Some("debug")).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter(Some("warn")).max_level_hint(), Some(LevelFilter::WARN));
    }
}
