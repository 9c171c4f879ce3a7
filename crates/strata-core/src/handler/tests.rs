use std::sync::Arc;

use arrow_array::{Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};

use super::*;
use crate::buffer::{OriginId, SequenceData};
use crate::config::{LateDataConfig, WindowType};
use crate::operator::{
    AggregateExpr, AggregationBuild, BuildStats, JoinBuild, JoinPartition, WindowAggregation,
    WindowJoin,
};
use crate::slice::SliceLookup;
use crate::testing::CollectingEmitter;
use crate::time::{TimeError, TimestampColumn, TimestampFormat};

const A: OriginId = OriginId::new(1);
const B: OriginId = OriginId::new(2);
const OUT: OriginId = OriginId::new(99);
const ID: HandlerId = HandlerId::new(7);

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("key", DataType::Int64, false),
        Field::new("value", DataType::Int64, false),
    ]))
}

fn ts_column() -> TimestampColumn {
    TimestampColumn::from_column("ts", TimestampFormat::UnixMillis)
}

/// Rows of `(ts, key, value)`.
fn events(schema: SchemaRef, rows: &[(i64, i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.2))),
        ],
    )
    .unwrap()
}

fn meta(watermark: i64, sequence: u64, origin: OriginId) -> BufferMetaData {
    BufferMetaData::new(watermark, SequenceData::single(sequence), origin)
}

fn column(buffer: &TupleBuffer, name: &str) -> Vec<i64> {
    buffer
        .data
        .column_by_name(name)
        .unwrap()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .values()
        .to_vec()
}

fn windows(emitter: &CollectingEmitter) -> Vec<(i64, i64)> {
    emitter
        .buffers()
        .iter()
        .map(|b| (column(b, "window_start")[0], column(b, "window_end")[0]))
        .collect()
}

struct Harness {
    handler: Arc<WindowBasedOperatorHandler>,
    ctx: PipelineContext,
    emitter: Arc<CollectingEmitter>,
    build: AggregationBuild,
}

impl Harness {
    fn new(
        config: WindowOperatorConfig,
        key: Option<&str>,
        aggregates: Vec<AggregateExpr>,
        workers: usize,
    ) -> Self {
        let operator = WindowOperator::Aggregation(
            WindowAggregation::try_new(schema(), key, aggregates).unwrap(),
        );
        let handler = Arc::new(WindowBasedOperatorHandler::try_new(ID, config, operator).unwrap());
        let emitter = Arc::new(CollectingEmitter::new());
        let ctx = PipelineContext::builder()
            .worker_threads(workers)
            .emitter(emitter.clone())
            .handler(Arc::clone(&handler))
            .build()
            .unwrap();
        handler.start(&ctx).unwrap();
        Self {
            handler,
            ctx,
            emitter,
            build: AggregationBuild::new(ID, ts_column()),
        }
    }

    fn count(window: WindowType, origins: &[OriginId]) -> Self {
        Self::count_with_late(window, origins, LateDataConfig::drop())
    }

    fn count_with_late(window: WindowType, origins: &[OriginId], late: LateDataConfig) -> Self {
        let config = WindowOperatorConfig::builder()
            .window(window)
            .left_origins(origins.iter().copied())
            .output_origin(OUT)
            .late_data(late)
            .build()
            .unwrap();
        Self::new(config, None, vec![AggregateExpr::count("n")], 1)
    }

    fn push(&self, rows: &[(i64, i64, i64)], watermark: i64, sequence: u64, origin: OriginId) -> BuildStats {
        let buffer = TupleBuffer::new(events(schema(), rows), meta(watermark, sequence, origin));
        self.build
            .process_buffer(&self.ctx.worker(0), &buffer)
            .unwrap()
    }

    fn counts(&self) -> Vec<i64> {
        self.emitter
            .buffers()
            .iter()
            .map(|b| column(b, "n")[0])
            .collect()
    }
}

#[test]
fn test_two_origins_trigger_in_order() {
    let h = Harness::count(WindowType::tumbling(10), &[A, B]);

    let stats = h.push(&[(1, 0, 0), (12, 0, 0), (25, 0, 0)], 25, 1, A);
    assert_eq!(stats.records_written, 3);
    assert_eq!(stats.windows_emitted, 0);

    // min(25, 5) = 5: no window ends at or before 5.
    h.push(&[(3, 0, 0)], 5, 1, B);
    assert!(h.emitter.buffers().is_empty());
    assert_eq!(h.handler.safe_watermark(), Watermark::new(5));

    // min(25, 30) = 25: windows ending at 10 and 20.
    let stats = h.push(&[(22, 0, 0), (29, 0, 0)], 30, 2, B);
    assert_eq!(stats.windows_emitted, 2);
    assert_eq!(windows(&h.emitter), vec![(0, 10), (10, 20)]);

    h.push(&[], 30, 2, A);
    assert_eq!(windows(&h.emitter), vec![(0, 10), (10, 20), (20, 30)]);
    assert_eq!(h.counts(), vec![2, 1, 3]);

    let buffers = h.emitter.buffers();
    for (i, buffer) in buffers.iter().enumerate() {
        assert_eq!(buffer.origin(), OUT);
        assert_eq!(buffer.sequence(), SequenceData::single(i as u64 + 1));
    }
    assert_eq!(
        buffers.iter().map(TupleBuffer::watermark).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
}

#[test]
fn test_unset_origin_blocks_triggering() {
    let h = Harness::count(WindowType::tumbling(10), &[A, B]);
    h.push(&[(1, 0, 0)], 1_000, 1, A);
    assert!(h.emitter.buffers().is_empty());
    assert!(h.handler.safe_watermark().is_unset());
}

#[test]
fn test_duplicate_metadata_is_noop() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (15, 0, 0)], 20, 1, A);
    assert_eq!(h.emitter.buffers().len(), 2);

    let worker = h.ctx.worker(0);
    assert_eq!(h.build.close(&worker, &meta(20, 1, A)).unwrap(), 0);
    assert_eq!(h.build.close(&worker, &meta(20, 1, A)).unwrap(), 0);
    assert_eq!(h.emitter.buffers().len(), 2);
    assert_eq!(h.handler.metrics().windows_triggered, 2);
}

#[test]
fn test_out_of_order_sequences_wait_for_gap() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (11, 0, 0)], 5, 1, A);

    // Sequence 3 arrives before 2: its watermark is not final yet.
    h.push(&[(21, 0, 0)], 30, 3, A);
    assert!(h.emitter.buffers().is_empty());

    h.push(&[(15, 0, 0)], 15, 2, A);
    assert_eq!(windows(&h.emitter), vec![(0, 10), (10, 20), (20, 30)]);
    assert_eq!(h.counts(), vec![1, 2, 1]);
}

#[test]
fn test_chunked_sequence_completes_on_all_chunks() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    let worker = h.ctx.worker(0);
    let part = |rows: &[(i64, i64, i64)], number: u64, last: bool| {
        TupleBuffer::new(
            events(schema(), rows),
            BufferMetaData::new(10, SequenceData::new(1, number, last), A),
        )
    };

    h.build.process_buffer(&worker, &part(&[(2, 0, 0)], 2, true)).unwrap();
    assert!(h.emitter.buffers().is_empty());
    h.build.process_buffer(&worker, &part(&[(3, 0, 0)], 1, false)).unwrap();
    assert_eq!(h.counts(), vec![2]);
}

#[test]
fn test_round_trip_count() {
    const N: i64 = 1_000;
    const M: i64 = 10;
    let h = Harness::count(WindowType::tumbling(N / M), &[A]);

    let rows: Vec<_> = (0..N).map(|ts| (ts, 0, 0)).collect();
    for (seq, chunk) in rows.chunks(64).enumerate() {
        h.push(chunk, chunk[0].0, seq as u64 + 1, A);
    }
    h.push(&[], N, (rows.len() / 64) as u64 + 2, A);

    assert_eq!(h.emitter.buffers().len(), M as usize);
    assert_eq!(h.counts().iter().sum::<i64>(), N);
    assert!(h.counts().iter().all(|c| *c == N / M));
    assert_eq!(h.handler.num_slices(), 0);

    let metrics = h.handler.metrics();
    assert_eq!(metrics.slices_created, M as u64);
    assert_eq!(metrics.slices_released, M as u64);
    assert_eq!(metrics.output_records, M as u64);
}

#[test]
fn test_graceful_stop_flushes_once() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (2, 0, 0)], 5, 1, A);
    assert!(h.emitter.buffers().is_empty());

    h.handler.stop(TerminationType::Graceful, &h.ctx).unwrap();
    assert_eq!(h.counts(), vec![2]);
    assert_eq!(h.handler.state(), HandlerState::Stopped);

    h.handler.stop(TerminationType::Graceful, &h.ctx).unwrap();
    assert_eq!(h.emitter.buffers().len(), 1);

    let metrics = h.handler.metrics();
    assert_eq!(metrics.windows_flushed, 1);
    assert_eq!(metrics.slices_discarded, 0);
    assert_eq!(h.handler.num_slices(), 0);
}

#[test]
fn test_graceful_stop_after_partial_trigger() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (11, 0, 0), (12, 0, 0)], 10, 1, A);
    assert_eq!(windows(&h.emitter), vec![(0, 10)]);

    h.handler.stop(TerminationType::Graceful, &h.ctx).unwrap();
    assert_eq!(windows(&h.emitter), vec![(0, 10), (10, 20)]);
    assert_eq!(h.counts(), vec![1, 2]);
}

#[test]
fn test_hard_stop_discards() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (2, 0, 0)], 5, 1, A);

    h.handler.stop(TerminationType::Hard, &h.ctx).unwrap();
    assert!(h.emitter.buffers().is_empty());
    assert_eq!(h.handler.state(), HandlerState::Stopped);
    assert_eq!(h.handler.metrics().slices_discarded, 1);

    // A later graceful stop has nothing left to flush.
    h.handler.stop(TerminationType::Graceful, &h.ctx).unwrap();
    assert!(h.emitter.buffers().is_empty());
}

#[test]
fn test_trigger_error_fails_handler() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (12, 0, 0)], 5, 1, A);

    // Replace the second slice's partition with state the aggregation
    // cannot merge.
    let store = h.handler.slice_store().unwrap();
    match store.get_or_create_slice(12).unwrap() {
        SliceLookup::Slice(slice) => {
            slice.write(0, |p| *p = PartitionState::Join(JoinPartition::default()));
        }
        SliceLookup::Late => panic!("slice [10, 20) should be open"),
    }

    let worker = h.ctx.worker(0);
    let buffer = TupleBuffer::new(events(schema(), &[]), meta(20, 2, A));
    assert!(matches!(
        h.build.process_buffer(&worker, &buffer),
        Err(OperatorError::MismatchedSliceShape { .. })
    ));

    // The first window went out; progress stops at its end.
    assert_eq!(windows(&h.emitter), vec![(0, 10)]);
    assert_eq!(h.handler.state(), HandlerState::Failed);
    assert_eq!(h.handler.last_trigger_watermark(), Watermark::new(10));

    let next = TupleBuffer::new(events(schema(), &[(25, 0, 0)]), meta(30, 3, A));
    assert!(matches!(
        h.build.execute(&worker, &next),
        Err(OperatorError::NotRunning { state: HandlerState::Failed, .. })
    ));
    assert!(matches!(
        h.build.close(&worker, &meta(30, 3, A)),
        Err(OperatorError::NotRunning { state: HandlerState::Failed, .. })
    ));

    h.handler.stop(TerminationType::Graceful, &h.ctx).unwrap();
    assert_eq!(h.handler.state(), HandlerState::Stopped);
    assert_eq!(windows(&h.emitter), vec![(0, 10)]);
    assert!(h.handler.metrics().slices_discarded >= 1);
    assert_eq!(h.handler.num_slices(), 0);
}

#[test]
fn test_sum_overflow_fails_handler() {
    let config = WindowOperatorConfig::builder()
        .window(WindowType::tumbling(10))
        .left_origins([A])
        .build()
        .unwrap();
    let h = Harness::new(config, None, vec![AggregateExpr::sum("value", "total")], 1);

    let buffer = TupleBuffer::new(
        events(schema(), &[(1, 0, i64::MAX), (2, 0, 1)]),
        meta(5, 1, A),
    );
    assert!(matches!(
        h.build.process_buffer(&h.ctx.worker(0), &buffer),
        Err(OperatorError::Overflow(_))
    ));
    assert_eq!(h.handler.state(), HandlerState::Failed);
    assert!(h.emitter.buffers().is_empty());
}

#[test]
fn test_late_records_dropped_and_counted() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    h.push(&[(1, 0, 0), (5, 0, 0)], 15, 1, A);
    assert_eq!(h.counts(), vec![2]);

    let stats = h.push(&[(3, 0, 0), (12, 0, 0), (4, 0, 0)], 20, 2, A);
    assert_eq!(stats.late_records, 2);
    assert_eq!(stats.records_written, 1);
    assert_eq!(h.counts(), vec![2, 1]);

    let metrics = h.handler.metrics();
    assert_eq!(metrics.late_records_dropped, 2);
    assert_eq!(metrics.late_records_side_output, 0);
    assert!(h.emitter.side_outputs().is_empty());
}

#[test]
fn test_min_timestamp_handled_as_late() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    let stats = h.push(&[(i64::MIN, 0, 0), (1, 0, 0)], 10, 1, A);
    assert_eq!(stats.late_records, 1);
    assert_eq!(stats.records_written, 1);
    assert_eq!(h.counts(), vec![1]);
    assert_eq!(h.handler.metrics().late_records_dropped, 1);
    assert_eq!(h.handler.state(), HandlerState::Running);
}

#[test]
fn test_late_records_routed_to_side_output() {
    let h = Harness::count_with_late(
        WindowType::tumbling(10),
        &[A],
        LateDataConfig::with_side_output("late".to_string()),
    );
    h.push(&[(1, 0, 0)], 15, 1, A);
    h.push(&[(12, 0, 0), (3, 5, 6)], 20, 2, A);

    let side = h.emitter.side_outputs();
    assert_eq!(side.len(), 1);
    assert_eq!(side[0].0, "late");
    assert_eq!(side[0].1.num_rows(), 1);
    let late = TupleBuffer::new(side[0].1.clone(), meta(0, 1, A));
    assert_eq!(column(&late, "ts"), vec![3]);
    assert_eq!(column(&late, "value"), vec![6]);
    assert_eq!(h.handler.metrics().late_records_side_output, 1);
}

#[test]
fn test_sliding_window_sums() {
    let config = WindowOperatorConfig::builder()
        .window(WindowType::sliding(10, 5))
        .left_origins([A])
        .build()
        .unwrap();
    let h = Harness::new(config, None, vec![AggregateExpr::sum("value", "total")], 1);

    h.push(&[(1, 0, 1), (6, 0, 2), (11, 0, 4)], 20, 1, A);

    assert_eq!(
        windows(&h.emitter),
        vec![(-5, 5), (0, 10), (5, 15), (10, 20)]
    );
    let totals: Vec<_> = h
        .emitter
        .buffers()
        .iter()
        .map(|b| column(b, "total")[0])
        .collect();
    assert_eq!(totals, vec![1, 3, 6, 4]);
    assert_eq!(h.handler.num_slices(), 0);
}

#[test]
fn test_sliding_window_keeps_shared_slices() {
    let config = WindowOperatorConfig::builder()
        .window(WindowType::sliding(10, 5))
        .left_origins([A])
        .build()
        .unwrap();
    let h = Harness::new(config, None, vec![AggregateExpr::count("n")], 1);

    h.push(&[(6, 0, 0), (11, 0, 0)], 10, 1, A);
    // [0,10) triggered; slice [5,10) is still needed by [5,15).
    assert_eq!(windows(&h.emitter), vec![(0, 10)]);
    assert_eq!(h.handler.num_slices(), 2);

    h.push(&[(7, 0, 0)], 15, 2, A);
    assert_eq!(windows(&h.emitter), vec![(0, 10), (5, 15)]);
    assert_eq!(h.counts(), vec![1, 3]);
}

#[test]
fn test_grouped_aggregation_sorted_by_key() {
    let config = WindowOperatorConfig::builder()
        .window(WindowType::tumbling(10))
        .left_origins([A])
        .build()
        .unwrap();
    let h = Harness::new(
        config,
        Some("key"),
        vec![AggregateExpr::count("n"), AggregateExpr::max("value", "hi")],
        1,
    );

    h.push(&[(1, 3, 10), (2, 1, 5), (3, 3, 40), (4, 2, 7)], 10, 1, A);

    let buffers = h.emitter.buffers();
    assert_eq!(buffers.len(), 1);
    assert_eq!(column(&buffers[0], "key"), vec![1, 2, 3]);
    assert_eq!(column(&buffers[0], "n"), vec![1, 1, 2]);
    assert_eq!(column(&buffers[0], "hi"), vec![5, 7, 40]);
}

#[test]
fn test_join_end_to_end() {
    let left_schema = schema();
    let right_schema = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("key", DataType::Int64, false),
        Field::new("amount", DataType::Int64, false),
    ]));
    let operator = WindowOperator::Join(
        WindowJoin::try_new(Arc::clone(&left_schema), Arc::clone(&right_schema), "key", "key")
            .unwrap(),
    );
    let config = WindowOperatorConfig::builder()
        .window(WindowType::tumbling(10))
        .left_origins([A])
        .right_origins([B])
        .output_origin(OUT)
        .build()
        .unwrap();
    let handler = Arc::new(WindowBasedOperatorHandler::try_new(ID, config, operator).unwrap());
    let emitter = Arc::new(CollectingEmitter::new());
    let ctx = PipelineContext::builder()
        .worker_threads(2)
        .emitter(emitter.clone())
        .handler(Arc::clone(&handler))
        .build()
        .unwrap();
    handler.start(&ctx).unwrap();

    let left = JoinBuild::new(ID, InputSide::Left, ts_column());
    let right = JoinBuild::new(ID, InputSide::Right, ts_column());
    assert_eq!(right.side(), InputSide::Right);

    left.process_buffer(
            &ctx.worker(0),
            &TupleBuffer::new(events(left_schema, &[(1, 7, 100), (4, 8, 200)]), meta(20, 1, A)),
        )
        .unwrap();
    // The right input has not reported yet.
    assert!(emitter.buffers().is_empty());

    right
        .process_buffer(
            &ctx.worker(1),
            &TupleBuffer::new(
                events(right_schema, &[(2, 7, 1000), (13, 7, 2000)]),
                meta(20, 1, B),
            ),
        )
        .unwrap();

    let buffers = emitter.buffers();
    assert_eq!(buffers.len(), 1);
    let out = &buffers[0];
    assert_eq!(out.num_records(), 1);
    assert_eq!(column(out, "window_end"), vec![10]);
    assert_eq!(column(out, "left_value"), vec![100]);
    assert_eq!(column(out, "right_amount"), vec![1000]);
    assert_eq!(out.origin(), OUT);

    // [10, 20) only had right rows.
    assert_eq!(handler.metrics().windows_triggered, 2);
    assert_eq!(handler.metrics().output_buffers, 1);
}

#[test]
fn test_lifecycle_transitions() {
    let operator = WindowOperator::Aggregation(
        WindowAggregation::try_new(schema(), None, vec![AggregateExpr::count("n")]).unwrap(),
    );
    let config = WindowOperatorConfig::builder()
        .window(WindowType::tumbling(10))
        .left_origins([A])
        .build()
        .unwrap();
    let handler = Arc::new(WindowBasedOperatorHandler::try_new(ID, config, operator).unwrap());
    let emitter = Arc::new(CollectingEmitter::new());
    let ctx = PipelineContext::builder()
        .emitter(emitter)
        .handler(Arc::clone(&handler))
        .build()
        .unwrap();
    let build = AggregationBuild::new(ID, ts_column());
    let buffer = TupleBuffer::new(events(schema(), &[(1, 0, 0)]), meta(1, 1, A));

    assert_eq!(handler.state(), HandlerState::Created);
    assert!(matches!(
        build.execute(&ctx.worker(0), &buffer),
        Err(OperatorError::NotRunning {
            state: HandlerState::Created,
            ..
        })
    ));

    handler.start(&ctx).unwrap();
    assert_eq!(handler.state(), HandlerState::Started);
    assert!(matches!(
        handler.start(&ctx),
        Err(OperatorError::InvalidTransition { action: "start", .. })
    ));

    build.process_buffer(&ctx.worker(0), &buffer).unwrap();
    assert_eq!(handler.state(), HandlerState::Running);

    handler.stop(TerminationType::Graceful, &ctx).unwrap();
    assert_eq!(handler.state(), HandlerState::Stopped);
    assert!(matches!(
        build.execute(&ctx.worker(0), &buffer),
        Err(OperatorError::NotRunning {
            state: HandlerState::Stopped,
            ..
        })
    ));
}

#[test]
fn test_stop_before_start() {
    let operator = WindowOperator::Aggregation(
        WindowAggregation::try_new(schema(), None, vec![AggregateExpr::count("n")]).unwrap(),
    );
    let config = WindowOperatorConfig::builder().left_origins([A]).build().unwrap();
    let handler = Arc::new(WindowBasedOperatorHandler::try_new(ID, config, operator).unwrap());
    let ctx = PipelineContext::builder()
        .emitter(Arc::new(CollectingEmitter::new()))
        .build()
        .unwrap();

    handler.stop(TerminationType::Graceful, &ctx).unwrap();
    assert_eq!(handler.state(), HandlerState::Stopped);
    assert!(handler.start(&ctx).is_err());
}

#[test]
fn test_partitions_default_to_worker_count() {
    let config = WindowOperatorConfig::builder()
        .left_origins([A])
        .build()
        .unwrap();
    let h = Harness::new(config, None, vec![AggregateExpr::count("n")], 4);
    assert_eq!(h.handler.slice_store().unwrap().num_partitions(), 4);

    let config = WindowOperatorConfig::builder()
        .left_origins([A])
        .num_partitions(2)
        .build()
        .unwrap();
    let h = Harness::new(config, None, vec![AggregateExpr::count("n")], 4);
    assert_eq!(h.handler.slice_store().unwrap().num_partitions(), 2);
}

#[test]
fn test_invalid_operator_configs() {
    let join = || {
        WindowOperator::Join(WindowJoin::try_new(schema(), schema(), "key", "key").unwrap())
    };
    let left_only = WindowOperatorConfig::builder().left_origins([A]).build().unwrap();
    assert!(matches!(
        WindowBasedOperatorHandler::try_new(ID, left_only, join()),
        Err(OperatorError::InvalidConfig(_))
    ));

    let aggregation = WindowOperator::Aggregation(
        WindowAggregation::try_new(schema(), None, vec![AggregateExpr::count("n")]).unwrap(),
    );
    let two_sided = WindowOperatorConfig::builder()
        .left_origins([A])
        .right_origins([B])
        .build()
        .unwrap();
    assert!(matches!(
        WindowBasedOperatorHandler::try_new(ID, two_sided, aggregation),
        Err(OperatorError::InvalidConfig(_))
    ));
}

#[test]
fn test_precondition_errors() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    let worker = h.ctx.worker(0);

    let unknown = AggregationBuild::new(HandlerId::new(404), ts_column());
    assert!(matches!(
        unknown.close(&worker, &meta(1, 1, A)),
        Err(OperatorError::UnknownHandler(id)) if id == HandlerId::new(404)
    ));

    assert!(matches!(
        h.build.close(&worker, &meta(1, 1, B)),
        Err(OperatorError::Time(TimeError::UnknownOrigin(origin))) if origin == B
    ));

    assert!(matches!(
        h.handler
            .check_and_trigger_windows(InputSide::Right, &meta(1, 1, A), &h.ctx),
        Err(OperatorError::UnexpectedInput(InputSide::Right))
    ));

    let wrong_schema = RecordBatch::try_from_iter(vec![(
        "ts",
        Arc::new(Int64Array::from(vec![1])) as _,
    )])
    .unwrap();
    assert!(matches!(
        h.build
            .execute(&worker, &TupleBuffer::new(wrong_schema, meta(1, 1, A))),
        Err(OperatorError::SchemaMismatch(_))
    ));
}

#[test]
fn test_registry_and_context() {
    let h = Harness::count(WindowType::tumbling(10), &[A]);
    assert_eq!(h.ctx.registry().ids(), vec![ID]);
    assert_eq!(h.ctx.num_worker_threads(), 1);
    assert!(Arc::ptr_eq(&h.ctx.handler(ID).unwrap(), &h.handler));

    let removed = h.ctx.registry().remove(ID).unwrap();
    assert!(Arc::ptr_eq(&removed, &h.handler));
    assert!(h.ctx.registry().is_empty());

    assert!(PipelineContext::builder().build().is_err());
    assert!(PipelineContext::builder()
        .worker_threads(0)
        .emitter(Arc::new(CollectingEmitter::new()))
        .build()
        .is_err());
}
