//! In-process reference host.
//!
//! Provides players, a single world, a command table with a line dispatcher
//! and a manually advanced tick scheduler. The console binary runs on it and
//! the integration tests drive scripts through it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ArgValue, ArgumentParser, BlockPos, CommandSource, CommandTable, GameMode, HostCommand,
    HostPlayer, HostServices, HostSyntax, HostWorld, ParsedArguments, PlayerDirectory, Position,
    ScheduledTask, TickScheduler,
};

/// Lowest and highest buildable block heights.
const MIN_Y: i32 = -64;
const MAX_Y: i32 = 319;

/// Ticks per second of game time.
const TICKS_PER_SECOND: f64 = 20.0;

/// Ticks per in-game day.
const TICKS_PER_DAY: f64 = 24_000.0;

const NAMED_COLORS: &[&str] = &[
    "black",
    "dark_blue",
    "dark_green",
    "dark_aqua",
    "dark_red",
    "dark_purple",
    "gold",
    "gray",
    "dark_gray",
    "blue",
    "green",
    "aqua",
    "red",
    "light_purple",
    "yellow",
    "white",
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Parse `namespace:path` or `path` (namespace defaults to `minecraft`).
pub fn parse_resource_location(s: &str) -> Option<String> {
    let (namespace, path) = match s.split_once(':') {
        Some((ns, path)) => (ns, path),
        None => ("minecraft", s),
    };
    let ns_ok = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(c));
    let path_ok = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-/".contains(c));
    (ns_ok && path_ok).then(|| format!("{namespace}:{path}"))
}

/// The single world of the local host.
#[derive(Debug)]
pub struct LocalWorld {
    name: String,
    blocks: Mutex<HashMap<BlockPos, String>>,
}

impl LocalWorld {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Block id at a position; unset positions are air.
    pub fn block_at(&self, pos: BlockPos) -> String {
        lock(&self.blocks)
            .get(&pos)
            .cloned()
            .unwrap_or_else(|| "minecraft:air".to_string())
    }
}

impl HostWorld for LocalWorld {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_block(&self, x: i32, y: i32, z: i32, block_id: &str) -> Result<(), String> {
        if !(MIN_Y..=MAX_Y).contains(&y) {
            return Err(format!("y={y} is outside the world height"));
        }
        let id = parse_resource_location(block_id)
            .ok_or_else(|| format!("invalid block id: {block_id}"))?;
        debug!(world = %self.name, x, y, z, block = %id, "set block");
        lock(&self.blocks).insert(BlockPos::new(x, y, z), id);
        Ok(())
    }
}

/// A player connected to the local host.
#[derive(Debug)]
pub struct LocalPlayer {
    id: Uuid,
    name: String,
    position: Mutex<Position>,
    game_mode: Mutex<GameMode>,
    messages: Mutex<Vec<String>>,
    world: Arc<LocalWorld>,
}

impl LocalPlayer {
    fn new(name: &str, world: Arc<LocalWorld>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            position: Mutex::new(Position::new(0.0, 64.0, 0.0)),
            game_mode: Mutex::new(GameMode::default()),
            messages: Mutex::new(Vec::new()),
            world,
        }
    }

    pub fn set_position(&self, position: Position) {
        *lock(&self.position) = position;
    }

    pub fn game_mode(&self) -> GameMode {
        *lock(&self.game_mode)
    }

    /// All messages received so far.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    /// Return and clear received messages.
    pub fn take_messages(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.messages))
    }
}

impl HostPlayer for LocalPlayer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn position(&self) -> Position {
        *lock(&self.position)
    }

    fn send_message(&self, text: &str) {
        info!(player = %self.name, "{text}");
        lock(&self.messages).push(text.to_string());
    }

    fn set_game_mode(&self, mode: GameMode) {
        *lock(&self.game_mode) = mode;
    }

    fn world(&self) -> Option<Arc<dyn HostWorld>> {
        Some(self.world.clone())
    }
}

/// Online players of the local host.
#[derive(Debug, Default)]
pub struct LocalDirectory {
    players: RwLock<HashMap<Uuid, Arc<LocalPlayer>>>,
}

impl LocalDirectory {
    fn find(&self, name: &str) -> Option<Arc<LocalPlayer>> {
        read(&self.players)
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }
}

impl PlayerDirectory for LocalDirectory {
    fn lookup_by_id(&self, id: Uuid) -> Option<Arc<dyn HostPlayer>> {
        read(&self.players)
            .get(&id)
            .map(|p| p.clone() as Arc<dyn HostPlayer>)
    }

    fn lookup_by_name(&self, name: &str) -> Option<Arc<dyn HostPlayer>> {
        self.find(name).map(|p| p as Arc<dyn HostPlayer>)
    }

    fn all_online(&self) -> Vec<Arc<dyn HostPlayer>> {
        let mut players: Vec<Arc<LocalPlayer>> = read(&self.players).values().cloned().collect();
        players.sort_by(|a, b| a.name.cmp(&b.name));
        players
            .into_iter()
            .map(|p| p as Arc<dyn HostPlayer>)
            .collect()
    }
}

/// Scheduler advanced explicitly by the host loop.
#[derive(Default)]
pub struct LocalScheduler {
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    tick: u64,
    next_seq: u64,
    /// Keyed by (due tick, submission order).
    queue: BTreeMap<(u64, u64), ScheduledTask>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick(&self) -> u64 {
        lock(&self.state).tick
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Advance by `ticks`, running every task that becomes due in order.
    ///
    /// Tasks run without the scheduler lock held, so they may schedule more.
    pub fn advance(&self, ticks: u64) -> usize {
        let mut ran = 0;
        for _ in 0..ticks {
            let due = {
                let mut state = lock(&self.state);
                state.tick += 1;
                let split_key = (state.tick + 1, 0);
                let later = state.queue.split_off(&split_key);
                std::mem::replace(&mut state.queue, later)
            };
            for (_, task) in due {
                task();
                ran += 1;
            }
        }
        ran
    }
}

impl TickScheduler for LocalScheduler {
    fn schedule_task(&self, delay_ticks: u64, task: ScheduledTask) {
        let mut state = lock(&self.state);
        let due = state.tick + delay_ticks;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert((due, seq), task);
    }
}

/// Result of dispatching a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Executed,
    UnknownCommand,
    InvalidSyntax,
}

/// Command table with a line dispatcher.
#[derive(Default)]
pub struct LocalCommandTable {
    commands: RwLock<HashMap<String, Arc<HostCommand>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl LocalCommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.commands).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<HostCommand>> {
        let name = name.to_lowercase();
        if let Some(command) = read(&self.commands).get(&name) {
            return Some(command.clone());
        }
        let target = read(&self.aliases).get(&name).cloned()?;
        read(&self.commands).get(&target).cloned()
    }

    /// Parse and run one command line (leading `/` optional).
    ///
    /// Syntaxes are tried in registration order; the first one whose
    /// arguments all parse and consume the whole line runs.
    pub fn dispatch(
        &self,
        sender: Arc<dyn CommandSource>,
        line: &str,
        players: &dyn PlayerDirectory,
    ) -> CommandOutcome {
        let line = line.trim().trim_start_matches('/');
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        let Some(command) = self.get(name) else {
            sender.send_message(&format!("Unknown command: {name}"));
            return CommandOutcome::UnknownCommand;
        };

        let tokens: Vec<&str> = rest.split_whitespace().collect();
        if tokens.is_empty() {
            if let Some(default) = &command.default_executor {
                default.executor.execute(sender, ParsedArguments::new());
                return CommandOutcome::Executed;
            }
        }

        for syntax in &command.syntaxes {
            if let Some(args) = parse_syntax(syntax, &tokens, sender.as_ref(), players) {
                syntax.executor.execute(sender, args);
                return CommandOutcome::Executed;
            }
        }

        let usage = command.usage();
        if usage.is_empty() {
            sender.send_message(&format!("Invalid usage of /{}", command.name));
        } else {
            sender.send_message(&format!("Usage: {}", usage.join(" | ")));
        }
        CommandOutcome::InvalidSyntax
    }
}

impl CommandTable for LocalCommandTable {
    fn register(&self, command: HostCommand) -> bool {
        let name = command.name.to_lowercase();
        let replaced = self.unregister(&name);
        {
            let mut aliases = write(&self.aliases);
            for alias in &command.aliases {
                aliases.insert(alias.to_lowercase(), name.clone());
            }
        }
        write(&self.commands).insert(name, Arc::new(command));
        replaced
    }

    fn unregister(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        let removed = write(&self.commands).remove(&name);
        if removed.is_some() {
            write(&self.aliases).retain(|_, target| *target != name);
        }
        removed.is_some()
    }

    fn contains(&self, name: &str) -> bool {
        read(&self.commands).contains_key(&name.to_lowercase())
    }
}

fn parse_syntax(
    syntax: &HostSyntax,
    tokens: &[&str],
    sender: &dyn CommandSource,
    players: &dyn PlayerDirectory,
) -> Option<ParsedArguments> {
    let mut args = ParsedArguments::new();
    let mut pos = 0;
    for (name, parser) in &syntax.arguments {
        let (value, used) = parse_argument(parser, &tokens[pos..], sender, players)?;
        args.insert(name.clone(), value);
        pos += used;
    }
    (pos == tokens.len()).then_some(args)
}

/// Parse one argument from the front of `tokens`, returning the value and
/// the number of tokens consumed.
fn parse_argument(
    parser: &ArgumentParser,
    tokens: &[&str],
    sender: &dyn CommandSource,
    players: &dyn PlayerDirectory,
) -> Option<(ArgValue, usize)> {
    let first = *tokens.first()?;
    match parser {
        ArgumentParser::Word => Some((ArgValue::Text(first.to_string()), 1)),
        ArgumentParser::String => parse_quoted(tokens),
        ArgumentParser::GreedyString | ArgumentParser::Command | ArgumentParser::Component => {
            Some((ArgValue::Text(tokens.join(" ")), tokens.len()))
        }
        ArgumentParser::Integer { min, max } | ArgumentParser::Long { min, max } => {
            let n: i64 = first.parse().ok()?;
            let in_range = min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m);
            in_range.then_some((ArgValue::Integer(n), 1))
        }
        ArgumentParser::Float { min, max } | ArgumentParser::Double { min, max } => {
            let n: f64 = first.parse().ok()?;
            let in_range =
                n.is_finite() && min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m);
            in_range.then_some((ArgValue::Float(n), 1))
        }
        ArgumentParser::Boolean => match first {
            "true" => Some((ArgValue::Boolean(true), 1)),
            "false" => Some((ArgValue::Boolean(false), 1)),
            _ => None,
        },
        ArgumentParser::Entity {
            single,
            players_only,
        } => {
            let ids = select_entities(first, sender, players)?;
            if ids.is_empty() || (*single && ids.len() != 1) {
                return None;
            }
            let value = if *players_only {
                ArgValue::Players(ids)
            } else {
                ArgValue::Entities(ids)
            };
            Some((value, 1))
        }
        ArgumentParser::Uuid => Uuid::parse_str(first)
            .ok()
            .map(|id| (ArgValue::Uuid(id), 1)),
        ArgumentParser::Enum(values) => values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(first))
            .map(|v| (ArgValue::Text(v.clone()), 1)),
        ArgumentParser::ItemStack => {
            parse_resource_location(first).map(|id| (ArgValue::Text(id), 1))
        }
        ArgumentParser::ResourceLocation => {
            parse_resource_location(first).map(|id| (ArgValue::Text(id), 1))
        }
        ArgumentParser::BlockPosition => {
            let coords = tokens
                .get(..3)?
                .iter()
                .map(|t| t.parse::<i32>().ok().map(f64::from))
                .collect::<Option<Vec<f64>>>()?;
            Some((ArgValue::Coordinates(coords), 3))
        }
        ArgumentParser::Vec3 => parse_floats(tokens, 3),
        ArgumentParser::Vec2 => parse_floats(tokens, 2),
        ArgumentParser::Color => parse_color(first).map(|c| (ArgValue::Color(c), 1)),
        ArgumentParser::Time => parse_ticks(first).map(|t| (ArgValue::Ticks(t), 1)),
    }
}

fn parse_quoted(tokens: &[&str]) -> Option<(ArgValue, usize)> {
    let first = tokens.first()?;
    let Some(opened) = first.strip_prefix('"') else {
        return Some((ArgValue::Text(first.to_string()), 1));
    };
    if let Some(inner) = opened.strip_suffix('"') {
        return Some((ArgValue::Text(inner.to_string()), 1));
    }
    let mut parts = vec![opened];
    for (i, token) in tokens.iter().enumerate().skip(1) {
        if let Some(last) = token.strip_suffix('"') {
            parts.push(last);
            return Some((ArgValue::Text(parts.join(" ")), i + 1));
        }
        parts.push(token);
    }
    None
}

fn parse_floats(tokens: &[&str], count: usize) -> Option<(ArgValue, usize)> {
    let coords = tokens
        .get(..count)?
        .iter()
        .map(|t| t.parse::<f64>().ok().filter(|n| n.is_finite()))
        .collect::<Option<Vec<f64>>>()?;
    Some((ArgValue::Coordinates(coords), count))
}

fn parse_color(s: &str) -> Option<String> {
    let lower = s.to_lowercase();
    if NAMED_COLORS.contains(&lower.as_str()) {
        return Some(lower);
    }
    let hex = lower.strip_prefix('#')?;
    (hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(lower)
}

/// `20`, `20t`, `1.5s` or `1d`, in ticks.
fn parse_ticks(s: &str) -> Option<i64> {
    let (number, multiplier) = if let Some(n) = s.strip_suffix('t') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, TICKS_PER_SECOND)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, TICKS_PER_DAY)
    } else {
        (s, 1.0)
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as i64)
}

fn select_entities(
    selector: &str,
    sender: &dyn CommandSource,
    players: &dyn PlayerDirectory,
) -> Option<Vec<Uuid>> {
    match selector {
        "@a" | "@e" => Some(players.all_online().iter().map(|p| p.id()).collect()),
        "@s" => sender.player_id().map(|id| vec![id]),
        "@p" => sender
            .player_id()
            .or_else(|| players.all_online().first().map(|p| p.id()))
            .map(|id| vec![id]),
        name => {
            let player = match Uuid::parse_str(name) {
                Ok(id) => players.lookup_by_id(id),
                Err(_) => players.lookup_by_name(name),
            }?;
            Some(vec![player.id()])
        }
    }
}

/// The operator console as a command source.
#[derive(Debug, Default)]
pub struct ConsoleSource {
    messages: Mutex<Vec<String>>,
}

impl ConsoleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_messages(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.messages))
    }
}

impl CommandSource for ConsoleSource {
    fn name(&self) -> String {
        "CONSOLE".to_string()
    }

    fn send_message(&self, text: &str) {
        info!(target: "console", "{text}");
        lock(&self.messages).push(text.to_string());
    }

    fn player_id(&self) -> Option<Uuid> {
        None
    }
}

/// A local player issuing a command.
#[derive(Debug, Clone)]
pub struct PlayerSource(pub Arc<LocalPlayer>);

impl CommandSource for PlayerSource {
    fn name(&self) -> String {
        self.0.name.clone()
    }

    fn send_message(&self, text: &str) {
        HostPlayer::send_message(self.0.as_ref(), text);
    }

    fn player_id(&self) -> Option<Uuid> {
        Some(self.0.id)
    }
}

/// The local host: one world, its players, commands and scheduler.
pub struct LocalServer {
    world: Arc<LocalWorld>,
    directory: Arc<LocalDirectory>,
    scheduler: Arc<LocalScheduler>,
    commands: Arc<LocalCommandTable>,
    console: Arc<ConsoleSource>,
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalServer {
    pub fn new() -> Self {
        Self {
            world: Arc::new(LocalWorld::new("overworld")),
            directory: Arc::new(LocalDirectory::default()),
            scheduler: Arc::new(LocalScheduler::new()),
            commands: Arc::new(LocalCommandTable::new()),
            console: Arc::new(ConsoleSource::new()),
        }
    }

    /// Handles for the scripting core.
    pub fn services(&self) -> HostServices {
        HostServices {
            scheduler: self.scheduler.clone(),
            commands: self.commands.clone(),
            players: self.directory.clone(),
        }
    }

    pub fn world(&self) -> &Arc<LocalWorld> {
        &self.world
    }

    pub fn directory(&self) -> &Arc<LocalDirectory> {
        &self.directory
    }

    pub fn scheduler(&self) -> &Arc<LocalScheduler> {
        &self.scheduler
    }

    pub fn commands(&self) -> &Arc<LocalCommandTable> {
        &self.commands
    }

    pub fn console(&self) -> &Arc<ConsoleSource> {
        &self.console
    }

    /// Connect a player, or return the one already online under that name.
    pub fn join(&self, name: &str) -> Arc<LocalPlayer> {
        if let Some(existing) = self.directory.find(name) {
            return existing;
        }
        let player = Arc::new(LocalPlayer::new(name, self.world.clone()));
        write(&self.directory.players).insert(player.id, player.clone());
        info!(player = %name, id = %player.id, "player joined");
        player
    }

    /// Disconnect a player by name.
    pub fn leave(&self, name: &str) -> Option<Arc<LocalPlayer>> {
        let player = self.directory.find(name)?;
        write(&self.directory.players).remove(&player.id);
        info!(player = %name, "player left");
        Some(player)
    }

    pub fn player(&self, name: &str) -> Option<Arc<LocalPlayer>> {
        self.directory.find(name)
    }

    /// Run a command line as a player.
    pub fn run_as_player(&self, name: &str, line: &str) -> CommandOutcome {
        match self.player(name) {
            Some(player) => {
                let source: Arc<dyn CommandSource> = Arc::new(PlayerSource(player));
                self.commands.dispatch(source, line, self.directory.as_ref())
            }
            None => {
                warn!(player = %name, "command from unknown player");
                CommandOutcome::UnknownCommand
            }
        }
    }

    /// Run a command line as the console.
    pub fn run_as_console(&self, line: &str) -> CommandOutcome {
        let source: Arc<dyn CommandSource> = self.console.clone();
        self.commands.dispatch(source, line, self.directory.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: Mutex<Vec<ParsedArguments>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl CommandExecutor for Recorder {
        fn execute(&self, sender: Arc<dyn CommandSource>, args: ParsedArguments) {
            sender.send_message("ok");
            self.calls.lock().unwrap().push(args);
        }
    }

    fn command(name: &str, syntaxes: Vec<HostSyntax>, default: Option<HostSyntax>) -> HostCommand {
        HostCommand {
            name: name.to_string(),
            aliases: vec![],
            description: None,
            syntaxes,
            default_executor: default,
        }
    }

    fn syntax(args: Vec<(&str, ArgumentParser)>, executor: Arc<Recorder>) -> HostSyntax {
        HostSyntax {
            arguments: args.into_iter().map(|(n, p)| (n.to_string(), p)).collect(),
            executor,
        }
    }

    #[test]
    fn test_scheduler_runs_due_tasks_in_order() {
        let scheduler = LocalScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, label) in [(5, "b"), (2, "a"), (5, "c")] {
            let order = order.clone();
            scheduler.schedule_task(delay, Box::new(move || order.lock().unwrap().push(label)));
        }

        assert_eq!(scheduler.advance(1), 0);
        assert_eq!(scheduler.advance(1), 1);
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.advance(3), 2);
        assert_eq!(scheduler.current_tick(), 5);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_scheduler_task_can_reschedule() {
        let scheduler = Arc::new(LocalScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));
        let inner_scheduler = scheduler.clone();
        let inner_count = count.clone();
        scheduler.schedule_task(
            1,
            Box::new(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let c = inner_count.clone();
                inner_scheduler.schedule_task(
                    1,
                    Box::new(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        scheduler.advance(2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_world_set_block() {
        let world = LocalWorld::new("test");
        assert!(world.set_block(1, 2, 3, "stone").is_ok());
        assert_eq!(world.block_at(BlockPos::new(1, 2, 3)), "minecraft:stone");
        assert_eq!(world.block_at(BlockPos::new(0, 0, 0)), "minecraft:air");
        assert!(world.set_block(0, 1000, 0, "stone").is_err());
        assert!(world.set_block(0, 0, 0, "Not Valid").is_err());
    }

    #[test]
    fn test_join_and_leave() {
        let server = LocalServer::new();
        let alice = server.join("Alice");
        assert_eq!(server.join("alice").id(), alice.id());
        assert_eq!(server.directory().all_online().len(), 1);
        assert!(server.directory().lookup_by_id(alice.id()).is_some());

        assert!(server.leave("ALICE").is_some());
        assert!(server.directory().all_online().is_empty());
        assert!(server.leave("Alice").is_none());
    }

    #[test]
    fn test_dispatch_picks_matching_syntax() {
        let server = LocalServer::new();
        let bob = server.join("Bob");
        let by_count = Recorder::new();
        let by_player = Recorder::new();
        server.commands().register(command(
            "give",
            vec![
                syntax(
                    vec![("count", ArgumentParser::Integer { min: Some(1), max: Some(64) })],
                    by_count.clone(),
                ),
                syntax(
                    vec![(
                        "target",
                        ArgumentParser::Entity {
                            single: true,
                            players_only: true,
                        },
                    )],
                    by_player.clone(),
                ),
            ],
            None,
        ));

        assert_eq!(server.run_as_console("/give 5"), CommandOutcome::Executed);
        assert_eq!(server.run_as_console("give Bob"), CommandOutcome::Executed);
        assert_eq!(server.run_as_console("give 65"), CommandOutcome::InvalidSyntax);

        let counts = by_count.calls.lock().unwrap();
        assert_eq!(counts[0].get("count"), Some(&ArgValue::Integer(5)));
        let targets = by_player.calls.lock().unwrap();
        assert_eq!(targets[0].get("target"), Some(&ArgValue::Players(vec![bob.id()])));
    }

    #[test]
    fn test_dispatch_default_executor_and_usage() {
        let server = LocalServer::new();
        let default = Recorder::new();
        server.commands().register(command(
            "spawn",
            vec![syntax(vec![("where", ArgumentParser::Word)], Recorder::new())],
            Some(syntax(vec![], default.clone())),
        ));

        assert_eq!(server.run_as_console("spawn"), CommandOutcome::Executed);
        assert_eq!(default.calls.lock().unwrap().len(), 1);

        assert_eq!(server.run_as_console("spawn a b"), CommandOutcome::InvalidSyntax);
        let messages = server.console().take_messages();
        assert_eq!(messages.last().unwrap(), "Usage: /spawn | /spawn <where>");
    }

    #[test]
    fn test_dispatch_unknown_and_alias() {
        let server = LocalServer::new();
        let recorder = Recorder::new();
        let mut cmd = command("hello", vec![], Some(syntax(vec![], recorder.clone())));
        cmd.aliases = vec!["hi".to_string()];
        server.commands().register(cmd);

        assert_eq!(server.run_as_console("hi"), CommandOutcome::Executed);
        assert_eq!(server.run_as_console("nope"), CommandOutcome::UnknownCommand);

        assert!(server.commands().unregister("hello"));
        assert_eq!(server.run_as_console("hi"), CommandOutcome::UnknownCommand);
        assert!(!server.commands().unregister("hello"));
    }

    #[test]
    fn test_register_reports_replacement() {
        let table = LocalCommandTable::new();
        assert!(!table.register(command("a", vec![], None)));
        assert!(table.register(command("A", vec![], None)));
        assert!(table.contains("a"));
        assert_eq!(table.names(), vec!["a"]);
    }

    #[test]
    fn test_parse_argument_kinds() {
        let console = ConsoleSource::new();
        let directory = LocalDirectory::default();
        let parse = |parser: ArgumentParser, line: &str| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            parse_argument(&parser, &tokens, &console, &directory)
        };

        assert_eq!(
            parse(ArgumentParser::String, "\"hello big world\" x"),
            Some((ArgValue::Text("hello big world".into()), 3))
        );
        assert_eq!(
            parse(ArgumentParser::GreedyString, "a b c"),
            Some((ArgValue::Text("a b c".into()), 3))
        );
        assert_eq!(
            parse(ArgumentParser::Boolean, "true"),
            Some((ArgValue::Boolean(true), 1))
        );
        assert_eq!(
            parse(ArgumentParser::Enum(vec!["On".into(), "Off".into()]), "off"),
            Some((ArgValue::Text("Off".into()), 1))
        );
        assert_eq!(
            parse(ArgumentParser::BlockPosition, "1 -2 3"),
            Some((ArgValue::Coordinates(vec![1.0, -2.0, 3.0]), 3))
        );
        assert_eq!(parse(ArgumentParser::Vec2, "1.5"), None);
        assert_eq!(
            parse(ArgumentParser::Color, "#FF00aa"),
            Some((ArgValue::Color("#ff00aa".into()), 1))
        );
        assert_eq!(
            parse(ArgumentParser::Time, "1.5s"),
            Some((ArgValue::Ticks(30), 1))
        );
        assert_eq!(parse(ArgumentParser::Time, "-1"), None);
        assert_eq!(
            parse(ArgumentParser::ResourceLocation, "diamond"),
            Some((ArgValue::Text("minecraft:diamond".into()), 1))
        );
        assert_eq!(
            parse(ArgumentParser::Entity { single: false, players_only: false }, "@a"),
            None
        );
    }
}
