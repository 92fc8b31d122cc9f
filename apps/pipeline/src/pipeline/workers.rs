//! Queue consumers: `resume-processing` feeds the batch accumulator,
//! `resume-ranking` drives the ranking orchestrator.

use std::sync::Arc;

use tracing::info;

use crate::broker::{Acknowledgement, Broker, BrokerError, ConsumerHandle};
use crate::broker::{RANKING_QUEUE, RESUME_PROCESSING_QUEUE};
use crate::config::PipelineConfig;
use crate::models::messages::{RankingJobMessage, ResumeProcessingMessage};
use crate::pipeline::accumulator::{AccumulatorSender, BatchAccumulator};
use crate::pipeline::ranking::RankingOrchestrator;
use crate::pipeline::resume_processor::ResumeProcessor;

pub struct Workers {
    consumers: Vec<ConsumerHandle>,
    accumulator: BatchAccumulator<ResumeProcessingMessage>,
}

impl Workers {
    pub fn start(
        broker: &Arc<Broker>,
        processor: ResumeProcessor,
        orchestrator: Arc<RankingOrchestrator>,
        config: &PipelineConfig,
    ) -> Result<Self, BrokerError> {
        let accumulator =
            BatchAccumulator::spawn(Arc::new(processor), config.batch_size, config.batch_timeout);

        let sender = accumulator.sender();
        let resumes = broker.consume(
            RESUME_PROCESSING_QUEUE,
            config.prefetch,
            move |message: ResumeProcessingMessage| buffer_resume(sender.clone(), message),
        )?;

        let ranking = broker.consume(
            RANKING_QUEUE,
            config.prefetch,
            move |message: RankingJobMessage| run_ranking(Arc::clone(&orchestrator), message),
        )?;

        info!("Pipeline workers started");
        Ok(Self {
            consumers: vec![resumes, ranking],
            accumulator,
        })
    }

    /// Stops consuming, then flushes and drains the accumulator.
    pub async fn shutdown(self) {
        for consumer in self.consumers {
            consumer.stop().await;
        }
        self.accumulator.shutdown().await;
        info!("Pipeline workers stopped");
    }
}

/// Acks as soon as the message is buffered; processing happens when the batch flushes.
async fn buffer_resume(
    sender: AccumulatorSender<ResumeProcessingMessage>,
    message: ResumeProcessingMessage,
) -> anyhow::Result<Acknowledgement> {
    info!(
        "Buffered resume {} (task {})",
        message.resume_id, message.task_id
    );
    sender.push(message).await?;
    Ok(Acknowledgement::Ack)
}

/// A failed run is terminal; the error makes the broker dead-letter the message.
async fn run_ranking(
    orchestrator: Arc<RankingOrchestrator>,
    message: RankingJobMessage,
) -> anyhow::Result<Acknowledgement> {
    orchestrator.run(&message).await?;
    Ok(Acknowledgement::Ack)
}
