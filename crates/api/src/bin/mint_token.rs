//! Print a signed admin token for local use.
//!
//! ```text
//! mint-token [user]
//! ```
//!
//! Signs with `JWT_SECRET` (read after loading `.env`); `user` defaults to
//! `local` and the token expires after `JWT_EXPIRY_MINS` (default 60).

use jobhost_api::auth::jwt::{generate_token, JwtConfig};

fn main() {
    dotenvy::dotenv().ok();

    let config = match JwtConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let user = std::env::args().nth(1).unwrap_or_else(|| "local".into());

    match generate_token(&user, &config) {
        Ok(token) => {
            eprintln!(
                "Token for '{user}', valid for {} minutes. Use it as `Authorization: Bearer <token>` or `?token=<token>`:",
                config.token_expiry_mins
            );
            println!("{token}");
        }
        Err(e) => {
            eprintln!("Failed to sign token: {e}");
            std::process::exit(1);
        }
    }
}
