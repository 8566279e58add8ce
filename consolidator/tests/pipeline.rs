use std::{num::NonZeroUsize, time::Duration};

use metric_consolidator::{Metric, MetricConsolidator, MetricMap, metric::Key};
use tokio::sync::mpsc;

const PRODUCERS: usize = 16;
const SENDS_PER_PRODUCER: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_metric_reaches_the_sink() {
    let (tx, mut rx) = mpsc::channel(2);
    let mc = MetricConsolidator::<MetricMap>::new(
        NonZeroUsize::new(4).unwrap(),
        Duration::from_millis(5),
        tx,
    );
    let handle = mc.handle();
    let (watcher, broadcaster) = consolidator_signal::signal();

    let consumer = tokio::spawn(async move {
        let mut batches = 0;
        let mut total = MetricMap::new();
        while let Some(batch) = rx.recv().await {
            assert_eq!(batch.len(), 4);
            batches += 1;
            total.merge(MetricMap::consolidate(batch));
        }
        (batches, total)
    });
    let run = tokio::spawn(mc.run(watcher));

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let handle = handle.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..SENDS_PER_PRODUCER {
                let member = format!("{p}-{i}");
                handle
                    .receive_metrics(vec![
                        Metric::counter("requests", &["env:test"], 1.0),
                        Metric::set("callers", &[], member),
                    ])
                    .await
                    .unwrap();
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    drop(handle);

    broadcaster.signal_and_wait().await;
    run.await.unwrap().unwrap();
    let (batches, total) = consumer.await.unwrap();

    assert!(batches >= 1);
    let requests = total.counter(&Key::new("requests", &["env:test"])).unwrap();
    assert!((requests - (PRODUCERS * SENDS_PER_PRODUCER) as f64).abs() < f64::EPSILON);
    assert_eq!(
        total.set(&Key::new("callers", &[])).unwrap().len(),
        PRODUCERS * SENDS_PER_PRODUCER
    );
}

#[tokio::test(start_paused = true)]
async fn metric_maps_merged_by_producers_are_flushed() {
    let (tx, mut rx) = mpsc::channel(1);
    let mc = MetricConsolidator::<MetricMap>::new(
        NonZeroUsize::new(2).unwrap(),
        Duration::from_secs(3600),
        tx,
    );
    let handle = mc.handle();
    let (watcher, broadcaster) = consolidator_signal::signal();
    let run = tokio::spawn(mc.run(watcher));

    let mut local = MetricMap::new();
    local.receive(Metric::gauge("queue_depth", &[], 3.0));
    local.receive(Metric::timer("latency", &[], 12.0).with_sample_rate(0.5));
    handle.receive_metric_map(local).await.unwrap();

    broadcaster.signal_and_wait().await;
    run.await.unwrap().unwrap();

    let flushed = MetricMap::consolidate(rx.recv().await.unwrap());
    assert_eq!(flushed.gauge(&Key::new("queue_depth", &[])), Some(3.0));
    let timer = flushed.timer(&Key::new("latency", &[])).unwrap();
    assert_eq!(timer.values, vec![12.0]);
    assert!((timer.count - 2.0).abs() < f64::EPSILON);
    assert!(rx.recv().await.is_none());
}
