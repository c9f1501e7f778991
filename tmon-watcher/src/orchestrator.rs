//! Job watcher
//!
//! Polls the queue, and for each leased job: resolves the frame, bootstraps the reference
//! catalogue when it is missing, measures the frame and records the result. Jobs run one
//! after another; a failing job is released for retry without touching the rest of the
//! batch.

use sqlx::{SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use tmon_common::db::{ColumnMap, RecordLayout};
use tracing::{error, info, warn};

use crate::catalogue::{ArtifactPaths, CatalogueBuilder, CatalogueEntry};
use crate::config::WatcherConfig;
use crate::detector::Detector;
use crate::error::{Result, WatcherError};
use crate::frame::{resolve_frame_path, FrameReader, LoadedFrame};
use crate::photometry::{report_outliers, FlagPolicy, TransmissionLogEntry, Unflagged};
use crate::queue::{self, Job, FILE_ARG};
use crate::store;
use crate::supervisor::{NullSupervisor, Supervisor};

/// How one job ended
#[derive(Debug)]
pub enum JobOutcome {
    /// Transmission recorded and job removed
    Completed { image_id: i64 },
    /// Frame not eligible; job removed without output
    Skipped { image_id: i64 },
    /// Job left queued for retry
    Failed(WatcherError),
}

impl JobOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

/// Result of one queue poll
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.failed
    }

    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Skipped { .. } => self.skipped += 1,
            JobOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// A catalogue built from a registered reference frame
#[derive(Debug)]
pub struct BuiltCatalogue {
    /// On-disk path of the reference frame
    pub source: PathBuf,
    pub entries: Vec<CatalogueEntry>,
}

/// Outcome of a job's work before it is committed
struct Processed {
    outcome: JobOutcome,
    /// Reference frame whose catalogue this job built
    bootstrapped: Option<PathBuf>,
}

pub struct Orchestrator<D, R> {
    pool: SqlitePool,
    config: WatcherConfig,
    detector: D,
    reader: R,
    supervisor: Box<dyn Supervisor>,
    flag_policy: Box<dyn FlagPolicy>,
    catalogue_layout: RecordLayout<CatalogueEntry>,
    transmission_layout: RecordLayout<TransmissionLogEntry>,
    instance_id: String,
}

impl<D: Detector, R: FrameReader> Orchestrator<D, R> {
    /// Record layouts are checked against `columns` here, before any job is touched
    pub fn new(
        pool: SqlitePool,
        config: WatcherConfig,
        columns: &ColumnMap,
        detector: D,
        reader: R,
    ) -> Result<Self> {
        Ok(Self {
            pool,
            config,
            detector,
            reader,
            supervisor: Box::new(NullSupervisor),
            flag_policy: Box::new(Unflagged),
            catalogue_layout: RecordLayout::derive(columns)?,
            transmission_layout: RecordLayout::derive(columns)?,
            instance_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn with_supervisor(mut self, supervisor: Box<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_flag_policy(mut self, policy: Box<dyn FlagPolicy>) -> Self {
        self.flag_policy = policy;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Poll forever; returns only when the supervisor cannot be reached
    pub async fn run(&self) -> Result<()> {
        self.supervisor.register().await?;
        info!(
            instance = %self.instance_id,
            job_type = %self.config.queue.job_type,
            "Watching job queue"
        );

        let mut poll = tokio::time::interval(self.config.queue.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.supervisor.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => match self.run_once().await {
                    Ok(_) => {}
                    Err(e) if e.is_job_scoped() => {
                        error!(error = %e, "Poll failed, retrying on the next tick");
                    }
                    Err(e) => return Err(e),
                },
                _ = heartbeat.tick() => {
                    self.supervisor.heartbeat().await?;
                }
            }
        }
    }

    /// One poll: lease a batch and process it in order
    ///
    /// Only process-scoped failures are returned; job failures are counted in the summary.
    pub async fn run_once(&self) -> Result<BatchSummary> {
        let queue = &self.config.queue;
        let jobs = queue::lease_jobs(
            &self.pool,
            &queue.job_type,
            &self.instance_id,
            queue.batch_size,
            queue.lease_secs,
        )
        .await?;

        let mut summary = BatchSummary::default();
        for job in &jobs {
            match self.process_job(job).await {
                JobOutcome::Failed(e) if !e.is_job_scoped() => return Err(e),
                outcome => summary.record(&outcome),
            }
        }

        if summary.total() > 0 {
            info!(
                completed = summary.completed,
                skipped = summary.skipped,
                failed = summary.failed,
                "Batch processed"
            );
        }
        Ok(summary)
    }

    /// Process one job inside its own transaction
    pub async fn process_job(&self, job: &Job) -> JobOutcome {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return self.fail(job, e.into()).await,
        };

        match self.process_job_in(&mut tx, job).await {
            Ok(processed) => {
                let committed = match queue::delete_job(&mut tx, job.job_id).await {
                    Ok(()) => tx.commit().await.map_err(WatcherError::from),
                    Err(e) => Err(e),
                };
                match committed {
                    Ok(()) => {
                        if let Some(source) = &processed.bootstrapped {
                            self.detector.release(source);
                        }
                        processed.outcome
                    }
                    Err(e) => self.fail(job, e).await,
                }
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(job_id = job.job_id, error = %rollback, "Rollback failed");
                }
                self.fail(job, e).await
            }
        }
    }

    async fn process_job_in(&self, conn: &mut SqliteConnection, job: &Job) -> Result<Processed> {
        let filename = job.filename.as_deref().ok_or_else(|| WatcherError::MissingArgument {
            job_id: job.job_id,
            key: FILE_ARG.to_string(),
        })?;

        let path = resolve_frame_path(Path::new(filename))?;
        let loaded = self.reader.load(&path)?;
        let image_id = loaded.frame.image_id;

        let ref_image_id = match loaded.frame.require_reference() {
            Ok(id) => id,
            Err(e @ WatcherError::NotAutoguided { .. }) => {
                info!(job_id = job.job_id, image_id, "{}, skipping", e);
                return Ok(Processed {
                    outcome: JobOutcome::Skipped { image_id },
                    bootstrapped: None,
                });
            }
            Err(e) => return Err(e),
        };

        let mut bootstrapped = None;
        if !store::reference_catalogue_exists(conn, ref_image_id).await? {
            info!(ref_image_id, "No reference catalogue, building one");
            bootstrapped = Some(self.bootstrap_catalogue(conn, ref_image_id).await?.source);
        }

        let entry = self.measure_frame(conn, &loaded, ref_image_id).await?;
        store::insert_transmission(conn, &self.transmission_layout, &entry).await?;

        info!(
            job_id = job.job_id,
            image_id,
            ref_image_id,
            median_flux_ratio = entry.median_flux_ratio,
            "Transmission recorded"
        );
        Ok(Processed {
            outcome: JobOutcome::Completed { image_id },
            bootstrapped,
        })
    }

    /// Release the lease so the job is retried on the next poll
    async fn fail(&self, job: &Job, error: WatcherError) -> JobOutcome {
        error!(job_id = job.job_id, file = ?job.filename, error = %error, "Job failed");
        if let Err(e) = queue::release_lease(&self.pool, job.job_id, &self.instance_id).await {
            warn!(job_id = job.job_id, error = %e, "Could not release lease");
        }
        JobOutcome::Failed(error)
    }

    /// Build the catalogue for `ref_image_id` from its registered reference frame
    pub async fn bootstrap_catalogue(
        &self,
        conn: &mut SqliteConnection,
        ref_image_id: i64,
    ) -> Result<BuiltCatalogue> {
        let filename = store::reference_image_path(conn, ref_image_id).await?;
        let path = resolve_frame_path(Path::new(&filename))?;
        let reference = self.reader.load(&path)?;

        let artifacts = &self.config.artifacts;
        let region = artifacts.region_path(ref_image_id);
        let fits = artifacts.catalogue_path(ref_image_id);
        let entries = self
            .build_catalogue(
                conn,
                &reference,
                ArtifactPaths {
                    region: region.as_deref(),
                    fits: fits.as_deref(),
                },
            )
            .await?;
        Ok(BuiltCatalogue {
            source: reference.source_path().to_path_buf(),
            entries,
        })
    }

    /// Build and persist the catalogue of an already loaded reference frame
    pub async fn build_catalogue(
        &self,
        conn: &mut SqliteConnection,
        reference: &LoadedFrame,
        artifacts: ArtifactPaths<'_>,
    ) -> Result<Vec<CatalogueEntry>> {
        let builder =
            CatalogueBuilder::new(&self.detector, &self.config.detection, &self.config.filter);
        builder
            .build(conn, &self.catalogue_layout, reference, artifacts)
            .await
    }

    /// Differential photometry of `frame` against the stored catalogue
    pub async fn measure_frame(
        &self,
        conn: &mut SqliteConnection,
        frame: &LoadedFrame,
        ref_image_id: i64,
    ) -> Result<TransmissionLogEntry> {
        let photometry = &self.config.photometry;
        let image_id = frame.frame.image_id;

        let reference = store::load_reference_catalogue(conn, ref_image_id).await?;
        let current = reference.measure_at(
            &frame.frame.data.view(),
            photometry.sky_radius_inner,
            photometry.sky_radius_outer,
        );
        let ratios = current.ratio_to(&reference, photometry.coordinate_tolerance)?;

        report_outliers(image_id, &current, &reference, &ratios, photometry.outlier_ratio);

        Ok(TransmissionLogEntry::summarise(
            image_id,
            &reference,
            &ratios,
            self.flag_policy.as_ref(),
        ))
    }

    /// Measure one frame file and record it, outside the queue
    pub async fn measure_file(&self, path: &Path) -> Result<TransmissionLogEntry> {
        let path = resolve_frame_path(path)?;
        let loaded = self.reader.load(&path)?;
        let ref_image_id = loaded.frame.require_reference()?;

        let mut tx = self.pool.begin().await?;
        let entry = self.measure_frame(&mut tx, &loaded, ref_image_id).await?;
        store::insert_transmission(&mut tx, &self.transmission_layout, &entry).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Build and record the catalogue of one reference frame file, outside the queue
    pub async fn build_catalogue_file(
        &self,
        path: &Path,
        artifacts: ArtifactPaths<'_>,
    ) -> Result<Vec<CatalogueEntry>> {
        let path = resolve_frame_path(path)?;
        let reference = self.reader.load(&path)?;

        let mut tx = self.pool.begin().await?;
        let entries = self.build_catalogue(&mut tx, &reference, artifacts).await?;
        store::register_reference_image(&mut tx, reference.frame.image_id, &path.display().to_string())
            .await?;
        tx.commit().await?;
        self.detector.release(reference.source_path());
        Ok(entries)
    }
}
