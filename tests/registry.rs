// Cross-thread draw-scope registry properties: collection sizes balance
// adds against successful removes, and UIDs are never reissued by a
// parent's stream, under concurrent mutation.

use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use glaze::RenderingContext;

fn context() -> Arc<RenderingContext> {
    Arc::new(RenderingContext::new(
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: 256,
                height: 256,
            },
        },
        Vec::new(),
        None,
        None,
    ))
}

#[test]
fn concurrent_pipeline_adds_balance_and_stay_unique() {
    let _ = env_logger::builder().is_test(true).try_init();

    const THREADS: usize = 4;
    const ADDS_PER_THREAD: usize = 128;
    const REMOVES_PER_THREAD: usize = 32;

    let context = context();
    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let context = context.clone();
        workers.push(std::thread::spawn(move || {
            let mut uids = Vec::new();
            let mut handles = Vec::new();
            for _ in 0..ADDS_PER_THREAD {
                let handle =
                    context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
                uids.push(handle.uid());
                handles.push(handle);
            }
            let mut removed = 0;
            for handle in handles.drain(..REMOVES_PER_THREAD) {
                assert!(context.remove_pipeline(handle));
                removed += 1;
            }
            (uids, removed)
        }));
    }

    let mut all_uids = HashSet::new();
    let mut total_adds = 0;
    let mut total_removes = 0;
    for worker in workers {
        let (uids, removed) = worker.join().unwrap();
        total_adds += uids.len();
        total_removes += removed;
        for uid in uids {
            assert!(all_uids.insert(uid), "parent stream reissued a UID");
        }
    }

    assert_eq!(total_adds, THREADS * ADDS_PER_THREAD);
    assert_eq!(context.pipeline_count(), total_adds - total_removes);
}

#[test]
fn concurrent_mesh_adds_under_one_shader_object() {
    let context = context();
    let pipeline = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
    let shader_object = context.add_shader_object(pipeline, &[]).unwrap();

    const THREADS: usize = 4;
    const MESHES_PER_THREAD: usize = 64;

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let context = context.clone();
        workers.push(std::thread::spawn(move || {
            let mut uids = Vec::new();
            for _ in 0..MESHES_PER_THREAD {
                let mesh = context
                    .add_mesh(pipeline, shader_object, &[], &[], vk::Buffer::null())
                    .expect("parent handles stay valid");
                uids.push(mesh.uid());
            }
            uids
        }));
    }

    let mut all_uids = HashSet::new();
    for worker in workers {
        for uid in worker.join().unwrap() {
            assert!(all_uids.insert(uid), "mesh stream reissued a UID");
        }
    }

    assert_eq!(
        context.mesh_count(pipeline, shader_object),
        Some(THREADS * MESHES_PER_THREAD)
    );
}

#[test]
fn interleaved_add_remove_across_threads_balances() {
    let context = context();
    let pipeline = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());

    const THREADS: usize = 4;
    const ROUNDS: usize = 50;

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let context = context.clone();
        workers.push(std::thread::spawn(move || {
            let mut kept = 0;
            for round in 0..ROUNDS {
                let handle = context
                    .add_shader_object(pipeline, &[])
                    .expect("pipeline handle stays valid");
                if round % 2 == 0 {
                    assert!(context.remove_shader_object(pipeline, handle));
                } else {
                    kept += 1;
                }
            }
            kept
        }));
    }

    let kept: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(context.shader_object_count(pipeline), Some(kept));
}

#[test]
fn stale_handles_from_other_threads_are_rejected() {
    let context = context();
    let pipeline = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
    assert!(context.remove_pipeline(pipeline));

    let worker = {
        let context = context.clone();
        std::thread::spawn(move || context.remove_pipeline(pipeline))
    };
    assert!(!worker.join().unwrap());
}
