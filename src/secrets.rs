//! Bot token lookup.
//!
//! `DISCORD_TOKEN` wins when set. Otherwise the token is read from the OS's
//! native secret storage, where an operator can store it once:
//! - Linux: libsecret (GNOME Keyring/KDE Wallet)
//! - macOS: Keychain
//! - Windows: Credential Manager
//!
//! Never log the token value.

use keyring::Entry;

pub const TOKEN_ENV: &str = "DISCORD_TOKEN";

const SERVICE_NAME: &str = "radio-relay";
const BOT_TOKEN_NAME: &str = "discord-bot-token";

/// The bot token, if configured anywhere. Lookup errors are logged, not returned.
pub fn get_bot_token() -> Option<String> {
    token_from(std::env::var(TOKEN_ENV).ok()).or_else(keyring_token)
}

fn token_from(value: Option<String>) -> Option<String> {
    value
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn keyring_token() -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, BOT_TOKEN_NAME) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("BotToken: failed to create keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(token) => token_from(Some(token)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("BotToken: failed to read keyring: {}", e);
            None
        }
    }
}
