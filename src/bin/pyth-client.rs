use {
    anyhow::{
        anyhow,
        Context,
        Result,
    },
    clap::{
        Parser,
        Subcommand,
    },
    pyth_oracle_client::client::{
        config::Config,
        env::Network,
        Client,
    },
    solana_sdk::pubkey::Pubkey,
    std::{
        io::IsTerminal,
        path::PathBuf,
        str::FromStr,
    },
    tracing_subscriber::{
        prelude::*,
        EnvFilter,
    },
};

#[derive(Parser, Debug)]
#[clap(author = "Pyth Data Association", version)]
/// Pyth oracle client - read and stream on-chain price data
struct Arguments {
    #[clap(short, long)]
    /// Path to configuration file. Defaults and PYTH_ environment variables
    /// are used when omitted
    config: Option<PathBuf>,

    #[clap(short, long, value_enum)]
    /// Overrides the network of the configuration
    network: Option<Network>,

    #[clap(short = 'L', long)]
    /// Whether to print file:line info for each log statement
    log_locations: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the mapping accounts and print every product with its attributes
    Products,
    /// Fetch every price account and print its aggregate price
    Prices,
    /// Stream price changes until interrupted
    Stream {
        #[clap(long = "price")]
        /// Price account whose aggregate price is followed
        prices:     Vec<Pubkey>,
        #[clap(long = "component", value_parser = parse_component)]
        /// PRICE:PUBLISHER pair whose component price is followed
        components: Vec<(Pubkey, Pubkey)>,
    },
}

fn parse_component(arg: &str) -> Result<(Pubkey, Pubkey)> {
    let (price, publisher) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected PRICE:PUBLISHER, got {arg}"))?;
    Ok((
        Pubkey::from_str(price).context("parsing price key")?,
        Pubkey::from_str(publisher).context("parsing publisher key")?,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arguments::parse();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(args.log_locations)
        .with_line_number(args.log_locations)
        .with_thread_ids(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Use the compact formatter if we're in a terminal, otherwise use the JSON formatter.
    if std::io::stderr().is_terminal() {
        registry.with(fmt_layer.compact()).init();
    } else {
        registry.with(fmt_layer.json()).init();
    }

    let mut config = Config::new(args.config.as_deref()).context("Could not parse config")?;
    if let Some(network) = args.network {
        config.env.network = network;
    }

    if let Err(err) = run(config, args.command).await {
        err.chain().for_each(|cause| eprintln!("{cause}"));
        return Err(err);
    }

    Ok(())
}

async fn run(config: Config, command: Command) -> Result<()> {
    let client = Client::new(&config)?;
    match command {
        Command::Products => products(&client).await,
        Command::Prices => prices(&client).await,
        Command::Stream { prices, components } => stream(&client, prices, components).await,
    }
}

async fn products(client: &Client) -> Result<()> {
    let products = client
        .query()
        .get_all_product_accounts(client.commitment())
        .await?;
    for product in products {
        println!("{}", product.key);
        for (key, value) in &product.account.attrs {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}

async fn prices(client: &Client) -> Result<()> {
    let prices = client
        .query()
        .get_all_price_accounts(client.commitment())
        .await?;
    for price in prices {
        match price.account.value() {
            Some((value, conf)) => println!("{} {value} ± {conf}", price.key),
            None => println!("{} {:?}", price.key, price.account.agg.status),
        }
    }
    Ok(())
}

async fn stream(client: &Client, prices: Vec<Pubkey>, components: Vec<(Pubkey, Pubkey)>) -> Result<()> {
    let handler = client.event_handler();
    for price in prices {
        handler.on_price_change(price, |update| {
            tracing::info!(
                key = %update.key,
                slot = update.slot,
                current = ?update.current(),
                previous = ?update.previous(),
                "Aggregate price changed.",
            );
        });
    }
    for (price, publisher) in components {
        handler.on_component_change(price, publisher, move |update| {
            tracing::info!(
                key = %update.key,
                publisher = %publisher,
                slot = update.slot,
                current = ?update.current(),
                previous = ?update.previous(),
                "Component price changed.",
            );
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            handler.close();
        }
        _ = handler.err() => {}
    }
    println!("Stream terminated: {}", handler.err().await);
    Ok(())
}
