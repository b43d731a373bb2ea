//! Seed an admin user.
//!
//! ```text
//! seed_admin --email ops@example.com --password s3cret --name "Ops" [--role super_admin] [--reset-password]
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "seed_admin", about = "Create or update an admin user")]
struct Args {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "admin")]
    role: String,
    /// Overwrite the password when the user already exists.
    #[arg(long, default_value_t = false)]
    reset_password: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    if !matches!(args.role.as_str(), "admin" | "super_admin") {
        bail!("role must be admin or super_admin");
    }
    if args.password.len() < 8 {
        bail!("password must be at least 8 characters");
    }

    let config = dispatcher_core::config::Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.docstore_uri)
        .await
        .context("failed to connect to document store")?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let hash = bcrypt::hash(&args.password, bcrypt::DEFAULT_COST)?;

    let existing: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(&args.email)
        .fetch_optional(&pool)
        .await?;

    match existing {
        Some((id,)) => {
            if args.reset_password {
                sqlx::query(
                    r#"
                    UPDATE users
                    SET password_hash = $1, name = $2, role = $3, updated_at = NOW()
                    WHERE id = $4
                    "#,
                )
                .bind(&hash)
                .bind(&args.name)
                .bind(&args.role)
                .bind(id)
                .execute(&pool)
                .await?;
                println!("updated admin {} ({})", args.email, id);
            } else {
                println!("admin {} already exists ({}); use --reset-password to update", args.email, id);
            }
        }
        None => {
            let id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO users (id, email, password_hash, name, role)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(&args.email)
            .bind(&hash)
            .bind(&args.name)
            .bind(&args.role)
            .execute(&pool)
            .await?;
            println!("created admin {} ({})", args.email, id);
        }
    }

    Ok(())
}
