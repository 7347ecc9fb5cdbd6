use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::sync::Arc;

use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use dotenv::dotenv;
use fgz::config::FgzConfig;
use fgz::data::{
    DataHandler, DirectoryLoader, EmbeddedTrajectory, PairWorker, PassthroughEmbedder,
    Prefetched, Prefetcher, TrajectoryPair,
};
use fgz::model::{DynamicsConfig, DynamicsFunction, RepresentationConfig, RepresentationModel};
use fgz::search::{DynamicsEnvironment, Fmc};
use fgz::train::{
    CheckpointMeta, CsvMetricsLogger, FgzTrainer, MetricsSink, MovingAverage, MultiSink,
    RepresentationMeta, RepresentationTrainer, RunDirectory, TargetState, TracingSink,
    TrainContext, run_name,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(not(feature = "metal"))]
type Backend = burn::backend::Autodiff<burn::backend::NdArray>;
#[cfg(feature = "metal")]
type Backend = burn::backend::Autodiff<burn::backend::Metal>;

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fgz=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Expert trajectories averaged into each task's target state
const TARGET_TRAJECTORIES_PER_TASK: usize = 16;

fn load_tasks(config: &FgzConfig) -> fgz::Result<Vec<DirectoryLoader>> {
    config
        .dataset_dirs
        .iter()
        .enumerate()
        .map(|(task_id, dir)| DirectoryLoader::new(dir, task_id))
        .collect()
}

fn train<B: AutodiffBackend>(config: &FgzConfig, device: B::Device) -> Result<(), Box<dyn Error>> {
    let embedder = Arc::new(PassthroughEmbedder::new(config.embedding_size));
    let mut data = DataHandler::new(
        load_tasks(config)?,
        embedder,
        config.trainer.frames_per_window(),
        config.trainer.seed,
    )?;
    let num_tasks = data.num_tasks();

    let dynamics_config = DynamicsConfig::new(
        config.embedding_size,
        config.trainer.discriminator_classes(num_tasks),
    )
    .with_camera_scale(config.camera_scale);
    let dynamics = dynamics_config.init::<B>(&device);
    let env = DynamicsEnvironment::new(dynamics, config.env.clone(), device);
    let fmc = Fmc::new(env, config.fmc.clone());
    let optimizer = AdamConfig::new().init::<B, DynamicsFunction<B>>();

    let name = config.run_name.clone().unwrap_or_else(run_name);
    let run = RunDirectory::new(&config.out_dir, &name);
    let mut ctx = TrainContext::new(fmc, optimizer, name.clone());
    let mut trainer = FgzTrainer::new(config.trainer.clone(), num_tasks)?;
    trainer.check_context(&ctx, config.embedding_size)?;

    let mut metrics = MultiSink::new()
        .with(TracingSink::new(config.log_every, 100))
        .with(CsvMetricsLogger::new(run.root().join("metrics"))?);

    tracing::info!("Starting run {} with {} tasks", name, num_tasks);
    let mut last_saved = 0;
    for _ in 0..config.train_steps {
        let report = trainer.train_sub_trajectories(&mut ctx, &mut data)?;
        metrics.record(&report)?;

        if ctx.train_steps_taken % config.checkpoint_every == 0 {
            save(&run, &ctx, &mut data, &dynamics_config, config)?;
            last_saved = ctx.train_steps_taken;
        }
    }
    if last_saved != ctx.train_steps_taken {
        save(&run, &ctx, &mut data, &dynamics_config, config)?;
    }
    metrics.flush()?;
    Ok(())
}

/// Checkpoint plus the target state the evaluator loads beside it
fn save<B, O>(
    run: &RunDirectory,
    ctx: &TrainContext<B, O>,
    data: &mut DataHandler<DirectoryLoader, PassthroughEmbedder>,
    dynamics_config: &DynamicsConfig,
    config: &FgzConfig,
) -> fgz::Result<()>
where
    B: AutodiffBackend,
    O: burn::optim::Optimizer<DynamicsFunction<B>, B>,
{
    let step = ctx.train_steps_taken;
    let meta = CheckpointMeta {
        step,
        run_name: ctx.run_name.clone(),
        num_tasks: data.num_tasks(),
        dynamics: dynamics_config.clone(),
        trainer: config.trainer.clone(),
    };
    run.save_checkpoint(&meta, ctx.dynamics(), &ctx.optimizer)?;

    let finals = data.final_embeddings_for_each_task(TARGET_TRAJECTORIES_PER_TASK)?;
    run.save_target_state(&TargetState::from_final_embeddings(step, &finals)?)
}

fn represent<B: AutodiffBackend>(
    config: &FgzConfig,
    device: B::Device,
) -> Result<(), Box<dyn Error>> {
    let embedder = Arc::new(PassthroughEmbedder::new(config.embedding_size));
    let loaders: Vec<Arc<DirectoryLoader>> = load_tasks(config)?.into_iter().map(Arc::new).collect();

    // Workers are spread round-robin over the tasks
    let workers = (0..config.num_workers)
        .map(|id| {
            PairWorker::new(
                id,
                Arc::clone(&loaders[id % loaders.len()]),
                Arc::clone(&embedder),
                config.pair_worker.clone(),
            )
        })
        .collect::<fgz::Result<Vec<_>>>()?;
    let mut prefetcher = Prefetcher::new(workers)?;

    let representation_config = RepresentationConfig::new(config.embedding_size);
    let model = representation_config.init::<B>(&device);
    let optimizer = AdamConfig::new().init::<B, RepresentationModel<B>>();
    let mut trainer = RepresentationTrainer::new(model, optimizer, config.representation.clone(), device);

    let name = config.run_name.clone().unwrap_or_else(run_name);
    let run = RunDirectory::new(&config.out_dir, &name);
    let mut loss = MovingAverage::new(100);
    let mut latest: Vec<Option<TrajectoryPair>> = (0..prefetcher.num_workers()).map(|_| None).collect();

    tracing::info!("Starting representation run {} with {} workers", name, prefetcher.num_workers());
    for step in 1..=config.train_steps {
        let Prefetched { worker, pair, .. } = prefetcher.sample_train_pair()?;
        loss.push(trainer.train_on_pair(&pair)?);
        latest[worker] = Some(pair);

        if step % config.log_every == 0 {
            tracing::info!("Step {}: tcc_loss={:.6}", step, loss.average());
        }
        if step % config.checkpoint_every == 0 || step == config.train_steps {
            let mut by_task: BTreeMap<usize, Vec<&EmbeddedTrajectory>> = BTreeMap::new();
            for pair in latest.iter().flatten() {
                for trajectory in [&pair.first, &pair.second] {
                    by_task.entry(trajectory.trajectory.task_id).or_default().push(trajectory);
                }
            }
            let tasks = by_task
                .into_iter()
                .map(|(task, trajectories)| Ok((task, trainer.target_state(&trajectories)?)))
                .collect::<fgz::Result<BTreeMap<_, _>>>()?;
            let meta = RepresentationMeta {
                step,
                run_name: name.clone(),
                config: representation_config.clone(),
                target: TargetState { step, tasks },
            };
            run.save_representation(&meta, trainer.model())?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    init_logging();

    let command = env::args().nth(1).unwrap_or_else(|| "train".to_string());
    let config = FgzConfig::from_env()?;
    config.validate()?;
    config.log_summary();

    let device = Default::default();
    match command.as_str() {
        "train" => train::<Backend>(&config, device),
        "represent" => represent::<Backend>(&config, device),
        other => Err(format!("unknown command `{other}`, expected `train` or `represent`").into()),
    }
}
