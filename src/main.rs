//! camhal demo: a simulated camera through preview, focus, capture and recording

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camhal::callbacks::{CameraCallbacks, FrameFaces, MsgType};
use camhal::display::ChannelWindow;
use camhal::driver::SimProvider;
use camhal::mem::BufferBlock;
use camhal::state_machine::State;
use camhal::{Camera, CameraRegistry, HalConfig, HalResult};
use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, Sender};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const CAMERA: u32 = 0;
const WAIT: Duration = Duration::from_secs(10);
const VIDEO_FRAMES: usize = 30;

/// What the camera told us, forwarded off its worker threads
#[derive(Debug)]
enum Event {
    Notify(MsgType, i32),
    Jpeg(usize),
    Video(BufferBlock),
}

struct DemoCallbacks(Sender<Event>);

impl CameraCallbacks for DemoCallbacks {
    fn notify(&self, msg: MsgType, ext1: i32, _ext2: i32) {
        let _ = self.0.send(Event::Notify(msg, ext1));
    }

    fn data(&self, msg: MsgType, data: Bytes, _index: u32, _metadata: Option<&FrameFaces>) {
        if msg == MsgType::COMPRESSED_IMAGE {
            let _ = self.0.send(Event::Jpeg(data.len()));
        }
    }

    fn data_timestamp(&self, _ts: Duration, _msg: MsgType, frame: &BufferBlock, _index: u32) {
        let _ = self.0.send(Event::Video(frame.clone()));
    }
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

/// Run a blocking camera call off the async runtime.
async fn hal<R, F>(registry: &Arc<CameraRegistry>, f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(&Camera) -> HalResult<R> + Send + 'static,
{
    let registry = registry.clone();
    let result = tokio::task::spawn_blocking(move || registry.with_camera(CAMERA, f)).await??;
    Ok(result?)
}

async fn next_event<T>(events: &Receiver<Event>, mut want: impl FnMut(Event) -> Option<T>) -> Result<T> {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv_async().await?;
            if let Some(v) = want(event) {
                return Ok::<_, color_eyre::Report>(v);
            }
        }
    })
    .await
    .map_err(|_| eyre!("timed out waiting for a camera event"))?
}

async fn reach(states: &Receiver<State>, target: State) -> Result<()> {
    tokio::time::timeout(WAIT, async {
        while states.recv_async().await? != target {}
        Ok::<_, color_eyre::Report>(())
    })
    .await
    .map_err(|_| eyre!("timed out waiting for {target:?}"))?
}

async fn run(registry: Arc<CameraRegistry>, min_undequeued: usize) -> Result<()> {
    let (tx, events) = flume::unbounded();
    let states = hal(&registry, |c| Ok(c.watch_states())).await?;
    hal(&registry, move |c| {
        c.set_callbacks(Some(Arc::new(DemoCallbacks(tx))))?;
        c.enable_msg_type(
            MsgType::ERROR
                | MsgType::SHUTTER
                | MsgType::FOCUS
                | MsgType::ZOOM
                | MsgType::COMPRESSED_IMAGE
                | MsgType::VIDEO_FRAME,
        )
    })
    .await?;

    // the compositor side of the preview window
    let (window, frames) = ChannelWindow::new(min_undequeued, 8);
    let displayed = Arc::new(AtomicUsize::new(0));
    let counter = displayed.clone();
    let compositor = tokio::spawn(async move {
        while frames.recv_async().await.is_ok() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    info!("Starting preview");
    hal(&registry, move |c| {
        c.set_preview_window(Some(window))?;
        c.start_preview()
    })
    .await?;

    hal(&registry, |c| c.auto_focus()).await?;
    let focused = next_event(&events, |e| match e {
        Event::Notify(MsgType::FOCUS, ext1) => Some(ext1 != 0),
        _ => None,
    })
    .await?;
    info!(focused, "Auto-focus done");

    hal(&registry, |c| c.set_parameters("zoom=4")).await?;
    let zoom = next_event(&events, |e| match e {
        Event::Notify(MsgType::ZOOM, ext1) => Some(ext1),
        _ => None,
    })
    .await?;
    info!(zoom, "Zoom applied");

    info!("Taking a picture");
    hal(&registry, |c| c.take_picture()).await?;
    let size = next_event(&events, |e| match e {
        Event::Jpeg(size) => Some(size),
        _ => None,
    })
    .await?;
    info!(bytes = size, "Snapshot JPEG delivered");
    reach(&states, State::PreviewStopped).await?;

    info!("Starting recording");
    hal(&registry, |c| {
        c.start_preview()?;
        c.start_recording()
    })
    .await?;

    let mut live_jpeg = None;
    for n in 0..VIDEO_FRAMES {
        let frame = next_event(&events, |e| match e {
            Event::Video(block) => Some(block),
            Event::Jpeg(size) => {
                live_jpeg = Some(size);
                None
            }
            _ => None,
        })
        .await?;
        hal(&registry, move |c| c.release_recording_frame(frame)).await?;
        if n == VIDEO_FRAMES / 2 {
            // only transitions from here on matter
            states.try_iter().for_each(drop);
            info!("Taking a live snapshot");
            hal(&registry, |c| c.take_picture()).await?;
        }
    }
    let size = match live_jpeg {
        Some(size) => size,
        None => {
            next_event(&events, |e| match e {
                Event::Jpeg(size) => Some(size),
                // keep the video flowing while we wait
                Event::Video(block) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hal(&registry, move |c| c.release_recording_frame(block)).await {
                            warn!("Release failed: {}", e);
                        }
                    });
                    None
                }
                _ => None,
            })
            .await?
        }
    };
    info!(bytes = size, "Live snapshot JPEG delivered");
    reach(&states, State::Recording).await?;

    hal(&registry, |c| {
        c.stop_recording()?;
        c.stop_preview()
    })
    .await?;
    let dump = hal(&registry, |c| c.dump()).await?;
    info!(%dump, "Camera state");

    registry.close(CAMERA)?;
    compositor.abort();
    info!(frames = displayed.load(Ordering::Relaxed), "Preview frames displayed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = HalConfig::load(path.as_deref())?;
    init_tracing(&config.logging.filter);
    camhal::CONFIG.store(Arc::new(config.clone()));

    info!("camhal launching...");
    let provider = Arc::new(SimProvider::new(2, config.camera.fps));
    let registry = Arc::new(CameraRegistry::new(provider));
    info!(cameras = registry.num_cameras(), "Simulated cameras available");
    registry.open(CAMERA)?;

    tokio::select! {
        result = run(registry.clone(), config.camera.min_undequeued) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            registry.close_all();
        }
    }

    info!("camhal shut down");
    Ok(())
}
