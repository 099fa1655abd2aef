use clap::Parser;
use duel_client::local_bus::LocalBus;
use duel_client::session::DuelSession;
use duel_client::transport::DuelChannel;
use duel_shared::duel::{DuelStatus, Player, Question, QuestionOption, RoomState};
use duel_shared::protocol::UserProfile;
use log::info;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay host to connect to (no short flag to avoid conflict with --help)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Relay port
    #[arg(short, long, env = "DUEL_PORT", default_value = "4000")]
    port: u16,

    /// Room to join
    #[arg(short, long, default_value = "duel-demo")]
    room: String,

    /// Player id; must differ between the two instances
    #[arg(short, long)]
    id: String,

    /// Display name
    #[arg(short, long)]
    name: String,

    /// Rounds to play
    #[arg(short, long, default_value = "3")]
    best_of: u32,
}

/// Headless duel player for manual testing.
/// Joins a room on a running relay, readies up, and answers every round
/// with a random option after a short think. Run two instances with
/// different ids against the same room to watch a full duel play out.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let url = format!("ws://{}:{}", args.host, args.port);

    let bus = Arc::new(LocalBus::new());
    let user = UserProfile {
        id: args.id.clone(),
        name: args.name.clone(),
    };
    let channel = DuelChannel::open(Arc::clone(&bus), &url, &args.room, Some(user)).await;
    let mut session = DuelSession::new(
        channel,
        &args.room,
        args.best_of,
        demo_questions(),
        Player::new(args.id.as_str(), args.name.as_str()),
    );

    info!("Joining {} on {} as {} ({})", args.room, url, args.name, args.id);
    session.set_ready(true).await?;
    info!("Ready; waiting for an opponent");

    while session.state().status != DuelStatus::Completed {
        if should_answer(&session) {
            let think = rand::thread_rng().gen_range(300..1500);
            tokio::time::sleep(Duration::from_millis(think)).await;
            if let Some(option) = random_option(session.state()) {
                info!("Answering with option {}", option);
                session.pick(&option).await?;
                session.confirm().await?;
                continue;
            }
            // Nothing to pick; fall through and let the round time out.
        }
        if !session.step().await? {
            break;
        }
    }

    println!("Duel over after {} round(s):", session.state().round_number);
    for player in session.state().players.values() {
        println!("  {}: {} points", player.name, player.score);
    }
    session.close().await;
    Ok(())
}

/// True while a round is running and this player has not locked an answer.
fn should_answer(session: &DuelSession) -> bool {
    session.state().status == DuelStatus::Active
        && session
            .my_player()
            .map_or(false, |p| p.answered_at_ms.is_none())
}

fn random_option(state: &RoomState) -> Option<String> {
    let question = state.question.as_ref()?;
    if question.options.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..question.options.len());
    Some(question.options[index].id.clone())
}

/// Both instances embed the same rotation, standing in for the quiz backend
/// the real app fetches questions from.
fn demo_questions() -> Vec<Question> {
    let bank = [
        (
            "q1",
            "What is 7 x 8?",
            [("a", "54"), ("b", "56"), ("c", "58")],
            "b",
        ),
        (
            "q2",
            "Which planet is closest to the sun?",
            [("a", "Mercury"), ("b", "Venus"), ("c", "Mars")],
            "a",
        ),
        (
            "q3",
            "How many sides does a hexagon have?",
            [("a", "5"), ("b", "6"), ("c", "7")],
            "b",
        ),
    ];
    bank.into_iter()
        .map(|(id, stem, options, correct)| Question {
            id: id.to_string(),
            stem: stem.to_string(),
            options: options
                .iter()
                .map(|(option_id, text)| QuestionOption {
                    id: option_id.to_string(),
                    text: text.to_string(),
                })
                .collect(),
            correct_option_id: correct.to_string(),
            time_limit_seconds: 10,
        })
        .collect()
}
