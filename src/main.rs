use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use lodestone::host::local::{CommandOutcome, LocalPlayer, LocalServer};
use lodestone::host::PlayerDirectory;
use lodestone::script::Hand;
use lodestone::{BlockPos, CommandSource, Config, HostPlayer, Position, Result, SandboxError, ScriptManager};

const HELP: &str = "commands: load <file> | eval <code> | join <name> | leave <name> | \
move <name> x y z | interact <name> x y z <block> | cmd <player|console> <line> | \
tick <n> | players | quit";

enum Flow {
    Continue,
    Quit,
}

/// Run blocking manager work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SandboxError::InvalidState(format!("background task failed: {e}")))?
}

fn player(server: &LocalServer, name: &str) -> Result<Arc<LocalPlayer>> {
    server
        .player(name)
        .ok_or_else(|| SandboxError::NotFound(format!("player '{name}'")))
}

fn number<T: std::str::FromStr>(s: Option<&str>, what: &str) -> Result<T> {
    s.and_then(|s| s.parse().ok())
        .ok_or_else(|| SandboxError::Validation(format!("expected a number for {what}")))
}

fn print_console(server: &LocalServer) {
    for message in server.console().take_messages() {
        println!("{message}");
    }
}

async fn handle(line: &str, server: &Arc<LocalServer>, manager: &Arc<ScriptManager>) -> Result<Flow> {
    let line = line.trim();
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    match command {
        "" => {}
        "help" => println!("{HELP}"),
        "quit" | "exit" => return Ok(Flow::Quit),
        "load" => {
            let file = args.next().unwrap_or(&manager.config().entry_script).to_string();
            let console: Arc<dyn CommandSource> = server.console().clone();
            let manager = Arc::clone(manager);
            let report = blocking(move || manager.load_script(&file, Some(console))).await?;
            print_console(server);
            if !report.stdout.is_empty() {
                println!("{}", report.stdout.trim_end());
            }
        }
        "eval" => {
            let code = rest.to_string();
            let manager = Arc::clone(manager);
            let result = blocking(move || manager.eval_adhoc(&code)).await?;
            if !result.stdout.is_empty() {
                println!("{}", result.stdout.trim_end());
            }
            if !result.stderr.is_empty() {
                println!("stderr: {}", result.stderr.trim_end());
            }
            if let Some(value) = result.value {
                println!("=> {value}");
            }
        }
        "join" => {
            let name = args.next().ok_or_else(|| SandboxError::Validation("join <name>".into()))?;
            let player = server.join(name);
            let manager = Arc::clone(manager);
            let report = blocking(move || manager.fire_player_join(player.as_ref())).await?;
            info!(event = %report.event, listeners = report.listeners, failures = report.failures, "event dispatched");
        }
        "leave" => {
            let name = args.next().ok_or_else(|| SandboxError::Validation("leave <name>".into()))?;
            let player = server
                .leave(name)
                .ok_or_else(|| SandboxError::NotFound(format!("player '{name}'")))?;
            let manager = Arc::clone(manager);
            blocking(move || manager.fire_player_leave(player)).await?;
        }
        "move" => {
            let player = player(server, args.next().unwrap_or_default())?;
            let position = Position::new(
                number(args.next(), "x")?,
                number(args.next(), "y")?,
                number(args.next(), "z")?,
            );
            player.set_position(position);
            let manager = Arc::clone(manager);
            blocking(move || manager.fire_player_move(player.as_ref(), position, true)).await?;
        }
        "interact" => {
            let player = player(server, args.next().unwrap_or_default())?;
            let pos = BlockPos::new(
                number(args.next(), "x")?,
                number(args.next(), "y")?,
                number(args.next(), "z")?,
            );
            let block = args.next().unwrap_or("minecraft:stone").to_string();
            let manager = Arc::clone(manager);
            blocking(move || manager.fire_player_block_interact(player.as_ref(), pos, &block, Hand::Main))
                .await?;
        }
        "cmd" => {
            let (who, command_line) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let who = who.to_string();
            let command_line = command_line.to_string();
            let host = Arc::clone(server);
            let outcome = blocking(move || {
                Ok(if who.eq_ignore_ascii_case("console") {
                    host.run_as_console(&command_line)
                } else {
                    host.run_as_player(&who, &command_line)
                })
            })
            .await?;
            print_console(server);
            if outcome != CommandOutcome::Executed {
                println!("{outcome:?}");
            }
        }
        "tick" => {
            let ticks: u64 = number(args.next().or(Some("1")), "ticks")?;
            let ran = server.scheduler().advance(ticks);
            println!("advanced {ticks} tick(s), {ran} task(s) ran");
        }
        "players" => {
            for p in server.directory().all_online() {
                println!("{} {} {}", p.name(), p.id(), p.position());
            }
        }
        other => println!("unknown command '{other}'; {HELP}"),
    }
    Ok(Flow::Continue)
}

#[tokio::main]
async fn main() {
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Err(e) = lodestone::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        lodestone::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return;
    }

    info!("Lodestone - sandboxed Lua scripting host");

    let server = Arc::new(LocalServer::new());
    let manager = match ScriptManager::new(config.scripting.clone(), server.services()) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("failed to start script manager: {e}");
            return;
        }
    };

    {
        let manager = Arc::clone(&manager);
        match blocking(move || manager.load_entry()).await {
            Ok(report) if report.success => info!(script = %report.script, "entry script loaded"),
            Ok(report) => warn!(script = %report.script, "entry script did not load"),
            Err(e) => error!("failed to load entry script: {e}"),
        }
    }

    let ticker = {
        let server = Arc::clone(&server);
        let period = Duration::from_millis(config.server.tick_millis);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                server.scheduler().advance(1);
            }
        })
    };

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        match line {
            Ok(Some(line)) => match handle(&line, &server, &manager).await {
                Ok(Flow::Quit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => println!("error: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                error!("failed to read stdin: {e}");
                break;
            }
        }
    }

    ticker.abort();
    let _ = blocking(move || {
        manager.shutdown();
        Ok(())
    })
    .await;
    info!("shut down");
}
