use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use canvas_sync::backend::MemoryBackend;
use canvas_sync::{Backends, CanvasSession, Identity, SessionConfig, ShapeDraft, ShapeId};

/// Two simulated clients editing one canvas over an in-memory backend
#[derive(Parser, Debug)]
#[command(name = "canvas-sync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Shapes each client creates
    #[arg(long, default_value_t = 3)]
    shapes: usize,

    /// Intermediate moves per drag gesture
    #[arg(long, default_value_t = 5)]
    drag_steps: usize,

    /// Session config file (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Canvas id shared by both clients
    #[arg(long, default_value = "demo-canvas")]
    canvas: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canvas_sync=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SessionConfig::load_from(path)?,
        None => SessionConfig::load()?,
    };

    let backend = MemoryBackend::new();
    let backends = Backends::memory(&backend);
    let mut alice = CanvasSession::new(
        config.clone(),
        Identity::new(&args.canvas, "alice").display_name("Alice"),
        backends.clone(),
    );
    let mut bob = CanvasSession::new(
        config,
        Identity::new(&args.canvas, "bob").display_name("Bob"),
        backends,
    );

    for session in [&mut alice, &mut bob] {
        session.load().await;
        if !session.connect().await {
            bail!(
                "{} could not subscribe: {}",
                session.identity().author_id,
                session.status().error().unwrap_or_default()
            );
        }
        if let Err(e) = session.join_presence().await {
            warn!(error = %e, "presence unavailable");
        }
    }

    // Each client draws a row of shapes
    let mut alice_ids = Vec::new();
    for i in 0..args.shapes {
        let x = 100.0 + i as f64 * 120.0;
        if let Some(shape) = alice
            .add_shape(ShapeDraft::rectangle(x, 100.0, 100.0, 60.0).fill("#ff0000"))
            .await
        {
            alice_ids.push(shape.id);
        }
        bob.add_shape(ShapeDraft::circle(x, 300.0, 40.0)).await;
    }
    sync_both(&mut alice, &mut bob);
    report(&alice, &bob, "after drawing");

    // Alice drags her first rectangle, Bob watches it move
    if let Some(&id) = alice_ids.first() {
        drag(&mut alice, id, args.drag_steps).await;
        sync_both(&mut alice, &mut bob);
        info!(
            undo = alice.history().undo_count(),
            bob_sees = ?bob.shape(id).map(|s| (s.x, s.y)),
            "drag recorded as one action"
        );
    }

    alice.move_cursor(250.0, 180.0).await;
    let heartbeat = alice.config().presence.heartbeat();
    tokio::time::sleep(heartbeat).await;
    for session in [&mut alice, &mut bob] {
        session.tick().await;
    }
    bob.poll_presence();
    for (participant, (x, y)) in bob.presence().cursors() {
        info!(who = %participant.display_name, x, y, color = participant.color, "remote cursor");
    }

    // Bob copies a shape and pastes it twice
    if let Some(&id) = alice_ids.last() {
        bob.copy(&[id]);
        let first = bob.paste().await;
        let second = bob.paste().await;
        info!(pasted = first.len() + second.len(), "bob pasted");
    }
    sync_both(&mut alice, &mut bob);
    report(&alice, &bob, "after paste");

    // Alice undoes everything she did, then redoes it
    let mut undone = 0;
    while alice.can_undo() {
        if !alice.undo().await? {
            break;
        }
        undone += 1;
    }
    sync_both(&mut alice, &mut bob);
    report(&alice, &bob, &format!("after {} undos", undone));

    let mut redone = 0;
    while alice.can_redo() {
        if !alice.redo().await? {
            break;
        }
        redone += 1;
    }
    sync_both(&mut alice, &mut bob);
    report(&alice, &bob, &format!("after {} redos", redone));

    alice.leave_presence().await;
    bob.leave_presence().await;
    alice.disconnect();
    bob.disconnect();
    Ok(())
}

async fn drag(session: &mut CanvasSession, id: ShapeId, steps: usize) {
    let Some(start) = session.shape(id).map(|s| (s.x, s.y)) else {
        return;
    };
    session.start_drag(id);
    for step in 1..=steps {
        let offset = step as f64 * 10.0;
        session.drag_to(id, start.0 + offset, start.1 + offset).await;
    }
    session.end_drag(id).await;
}

fn sync_both(a: &mut CanvasSession, b: &mut CanvasSession) {
    a.process_remote();
    b.process_remote();
}

fn report(alice: &CanvasSession, bob: &CanvasSession, stage: &str) {
    let converged = alice.store().len() == bob.store().len()
        && alice.store().iter().all(|s| bob.shape(s.id) == Some(s));
    info!(
        stage,
        alice = alice.store().len(),
        bob = bob.store().len(),
        converged,
        "canvas state"
    );
}
