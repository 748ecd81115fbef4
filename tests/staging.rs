use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use approx::assert_relative_eq;
use loopnest::{
    execute, tile_bounds, AccessError, Backend, ConfigError, Device, IndexSpace, Kernel,
    LoopError, Policy, ReduceSum, Resource, Sequential, StagingTile, Threaded,
};

const ROWS: i64 = 144;
const COLS: i64 = 255;
const TS: i64 = 16;

fn source(r: i64, c: i64) -> i64 {
    r * COLS + c
}

/// Transpose through a staging tile. The store phase of every tile reads the
/// cell written by the mirrored participant, so it only sees the right data
/// if the load phase has completed for the whole tile.
fn transpose<B: Backend>(backend: &B, load: Policy, store: Policy) -> Vec<i64> {
    let space = IndexSpace::new([(0, ROWS), (0, COLS)]).unwrap();
    let out: Vec<AtomicI64> = (0..ROWS * COLS).map(|_| AtomicI64::new(-1)).collect();

    let kernel = Kernel::<i64>::new()
        .body(|ctx| {
            let (r, c) = (ctx.index(0)?, ctx.index(1)?);
            ctx.tile(0)?.set(&[r % TS, c % TS], source(r, c))
        })
        .body(|ctx| {
            let (r, c) = (ctx.index(0)?, ctx.index(1)?);
            let (r0, r1) = tile_bounds(ROWS, TS, r / TS)?;
            let (c0, c1) = tile_bounds(COLS, TS, c / TS)?;
            let (mr, mc) = (r0 + r1 - 1 - r, c0 + c1 - 1 - c);
            let v = ctx.tile(0)?.get(&[mr - r0, mc - c0])?;
            out[(mc * ROWS + mr) as usize].store(v, Ordering::Relaxed);
            Ok(())
        });

    let p = Policy::tile(
        0,
        TS,
        [Policy::tile(
            1,
            TS,
            [Policy::staging(&[TS as usize, TS as usize], [load, store])],
        )],
    );
    execute(&p, &space, backend, &kernel).unwrap();
    drop(kernel);
    out.into_iter().map(AtomicI64::into_inner).collect()
}

fn check_transpose(out: &[i64]) {
    for r in 0..ROWS {
        for c in 0..COLS {
            assert_eq!(out[(c * ROWS + r) as usize], source(r, c), "({r}, {c})");
        }
    }
}

fn nest(outer: Resource, inner: Resource, body: usize) -> Policy {
    Policy::par(1, outer, [Policy::par(0, inner, [Policy::body(body)])])
}

#[test]
fn test_transpose_sequential() {
    let load = Policy::seq(0, [Policy::seq(1, [Policy::body(0)])]);
    let store = Policy::seq(1, [Policy::seq(0, [Policy::body(1)])]);
    check_transpose(&transpose(&Sequential, load, store));
}

#[test]
fn test_transpose_threaded() {
    let threaded = Threaded::new().grain(4);
    let load = nest(Resource::CpuWorker, Resource::CpuWorker, 0);
    let store = nest(Resource::CpuWorker, Resource::VectorLane, 1);
    check_transpose(&transpose(&threaded, load, store));
}

#[test]
fn test_transpose_device_threads() {
    let load = nest(Resource::GpuThread, Resource::GpuThread, 0);
    let store = nest(Resource::GpuThread, Resource::GpuThread, 1);
    check_transpose(&transpose(&Device::new(64), load, store));
}

#[test]
fn test_transpose_collapsed() {
    let load = Policy::collapse(&[0, 1], Resource::GpuThread, [Policy::body(0)]);
    let store = Policy::collapse(&[1, 0], Resource::GpuThread, [Policy::body(1)]);
    check_transpose(&transpose(&Threaded::new(), load.clone(), store.clone()));
    check_transpose(&transpose(&Device::default(), load, store));
}

#[test]
fn test_barrier_splits_thread_loop() {
    let space = IndexSpace::new([(0, ROWS), (0, COLS)]).unwrap();
    let out: Vec<AtomicI64> = (0..ROWS * COLS).map(|_| AtomicI64::new(-1)).collect();
    let kernel = Kernel::<i64>::new()
        .body(|ctx| {
            let (r, c) = (ctx.index(0)?, ctx.index(1)?);
            ctx.tile(0)?.set(&[r % TS, c % TS], source(r, c))
        })
        .body(|ctx| {
            let (r, c) = (ctx.index(0)?, ctx.index(1)?);
            let (r0, r1) = tile_bounds(ROWS, TS, r / TS)?;
            let (c0, c1) = tile_bounds(COLS, TS, c / TS)?;
            let (mr, mc) = (r0 + r1 - 1 - r, c0 + c1 - 1 - c);
            let v = ctx.tile(0)?.get(&[mr - r0, mc - c0])?;
            out[(mc * ROWS + mr) as usize].store(v, Ordering::Relaxed);
            Ok(())
        });

    // one thread nest with a barrier between the load and the store
    let threads = Policy::par(
        1,
        Resource::GpuThread,
        [Policy::par(
            0,
            Resource::GpuThread,
            [Policy::body(0), Policy::barrier(), Policy::body(1)],
        )],
    );
    let p = Policy::tile(
        0,
        TS,
        [Policy::tile(1, TS, [Policy::staging(&[16, 16], [threads])])],
    );

    let backends: [&dyn Backend; 3] = [&Sequential, &Threaded::new(), &Device::new(32)];
    for backend in backends {
        out.iter().for_each(|v| v.store(-1, Ordering::Relaxed));
        execute(&p, &space, backend, &kernel).unwrap();
        let snapshot: Vec<i64> = out.iter().map(|v| v.load(Ordering::Relaxed)).collect();
        check_transpose(&snapshot);
    }
}

const N: i64 = 9;
const M: i64 = 12;
const P: i64 = 15;
const MT: i64 = 4;

fn a(n: i64, m: i64) -> f64 {
    n as f64 + 0.5 * m as f64
}

fn b(m: i64, p: i64) -> f64 {
    0.25 * (m - p) as f64
}

/// C = A * B with three nested staging scopes: the output accumulator,
/// a tile of A and a tile of B.
fn matmul<B: Backend>(backend: &B, thread: Resource) -> StagingTile<f64> {
    let space = IndexSpace::new([(0, N), (0, M), (0, P)]).unwrap();
    let c = StagingTile::<f64>::acquire(&[N as usize, P as usize]).unwrap();

    let kernel = Kernel::<f64>::new()
        // 0: load A tile
        .body(|ctx| {
            let (n, m) = (ctx.index(0)?, ctx.index(1)?);
            ctx.tile(1)?.set(&[n % MT, m % MT], a(n, m))
        })
        // 1: load B tile
        .body(|ctx| {
            let (m, p) = (ctx.index(1)?, ctx.index(2)?);
            ctx.tile(2)?.set(&[m % MT, p % MT], b(m, p))
        })
        // 2: accumulate one product term
        .body(|ctx| {
            let (n, m, p) = (ctx.index(0)?, ctx.index(1)?, ctx.index(2)?);
            let term = ctx.tile(1)?.get(&[n % MT, m % MT])? * ctx.tile(2)?.get(&[m % MT, p % MT])?;
            ctx.tile(0)?.update(&[n % MT, p % MT], |acc| acc + term)?;
            Ok(())
        })
        // 3: write the output tile
        .body(|ctx| {
            let (n, p) = (ctx.index(0)?, ctx.index(2)?);
            c.set(&[n, p], ctx.tile(0)?.get(&[n % MT, p % MT])?)
        });

    let pair = |d0, d1, children: Vec<Policy>| {
        Policy::par(d0, thread, [Policy::par(d1, thread, children)])
    };
    let shape = [MT as usize, MT as usize];

    let p = Policy::tile(
        0,
        MT,
        [Policy::tile(
            2,
            MT,
            [Policy::staging(
                &shape,
                [
                    Policy::tile(
                        1,
                        MT,
                        [Policy::staging(
                            &shape,
                            [Policy::staging(
                                &shape,
                                [
                                    pair(0, 1, vec![Policy::body(0)]),
                                    pair(1, 2, vec![Policy::body(1)]),
                                    Policy::barrier(),
                                    pair(0, 2, vec![Policy::seq(1, [Policy::body(2)])]),
                                    Policy::barrier(),
                                ],
                            )],
                        )],
                    ),
                    pair(0, 2, vec![Policy::body(3)]),
                ],
            )],
        )],
    );
    execute(&p, &space, backend, &kernel).unwrap();
    drop(kernel);
    c
}

fn check_matmul(c: &StagingTile<f64>) {
    for n in 0..N {
        for p in 0..P {
            let expected: f64 = (0..M).map(|m| a(n, m) * b(m, p)).sum();
            assert_relative_eq!(c.get(&[n, p]).unwrap(), expected, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_matmul_all_backends() {
    check_matmul(&matmul(&Sequential, Resource::GpuThread));
    check_matmul(&matmul(&Threaded::new(), Resource::CpuWorker));
    check_matmul(&matmul(&Device::new(8), Resource::GpuThread));
}

#[test]
fn test_tile_per_block_activation() {
    let space = IndexSpace::new([(0, 6), (0, 10)]).unwrap();
    let total = ReduceSum::<i64>::new(0);
    let kernel = Kernel::<i64>::new()
        .attach(&total)
        .body(|ctx| {
            ctx.tile(0)?.at(&[ctx.index(1)?])?.set(1);
            Ok(())
        })
        .body(|ctx| {
            total.contribute(ctx.tile(0)?.to_vec().iter().sum());
            Ok(())
        });
    // every block gets its own zeroed tile
    let p = Policy::par(
        0,
        Resource::GpuBlock,
        [Policy::staging(
            &[10],
            [Policy::par(1, Resource::GpuThread, [Policy::body(0)]), Policy::body(1)],
        )],
    );
    execute(&p, &space, &Device::new(4), &kernel).unwrap();
    assert_eq!(total.get().unwrap(), 60);
}

#[test]
fn test_cross_block_staging_rejected() {
    let space = IndexSpace::new([(0, 4), (0, 4)]).unwrap();
    let ran = AtomicBool::new(false);
    let kernel = Kernel::<f32>::new().body(|_| {
        ran.store(true, Ordering::Relaxed);
        Ok(())
    });
    let p = Policy::staging(
        &[4],
        [Policy::par(
            0,
            Resource::GpuBlock,
            [Policy::par(1, Resource::GpuThread, [Policy::body(0)])],
        )],
    );
    let err = execute(&p, &space, &Device::default(), &kernel).unwrap_err();
    assert_eq!(err, LoopError::Config(ConfigError::CrossBlockStaging { dim: 0 }));

    let p = Policy::staging(
        &[4, 4],
        [Policy::collapse(&[0, 1], Resource::GpuBlock, [Policy::body(0)])],
    );
    let err = execute(&p, &space, &Device::default(), &kernel).unwrap_err();
    assert_eq!(err, LoopError::Config(ConfigError::CrossBlockStaging { dim: 0 }));
    assert!(!ran.load(Ordering::Relaxed));
}

#[test]
fn test_barrier_cannot_join_outer_tile_across_threads() {
    // every thread writes its own cell of the shared outer tile, then reads
    // its neighbour's after a barrier inside a per-thread scope
    let space = IndexSpace::new([(0, 4)]).unwrap();
    let ran = AtomicBool::new(false);
    let kernel = Kernel::<i64>::new()
        .body(|ctx| {
            ran.store(true, Ordering::Relaxed);
            let i = ctx.index(0)?;
            ctx.tile(0)?.set(&[i], i + 1)
        })
        .body(|ctx| {
            ran.store(true, Ordering::Relaxed);
            let i = ctx.index(0)?;
            ctx.tile(0)?.get(&[(i + 1) % 4]).map(|_: i64| ())
        });
    let p = Policy::staging(
        &[4],
        [Policy::par(
            0,
            Resource::GpuThread,
            [Policy::staging(
                &[1],
                [Policy::body(0), Policy::barrier(), Policy::body(1)],
            )],
        )],
    );
    for backend in [&Sequential as &dyn Backend, &Threaded::new(), &Device::default()] {
        let err = execute(&p, &space, backend, &kernel).unwrap_err();
        assert_eq!(
            err,
            LoopError::Config(ConfigError::BarrierAcrossParallel { dim: 0 })
        );
    }
    assert!(!ran.load(Ordering::Relaxed));
}

#[test]
fn test_staging_access_errors() {
    let space = IndexSpace::new([(0, 8)]).unwrap();

    let kernel = Kernel::<f64>::new().body(|ctx| ctx.tile(0)?.set(&[ctx.index(0)?], 1.0));
    let p = Policy::staging(&[4], [Policy::seq(0, [Policy::body(0)])]);
    let err = execute(&p, &space, &Sequential, &kernel).unwrap_err();
    assert_eq!(
        err,
        LoopError::Access(AccessError::Staging {
            index: vec![4],
            shape: vec![4],
        })
    );

    let kernel = Kernel::<f64>::new().body(|ctx| ctx.tile(1).map(drop));
    let err = execute(&p, &space, &Sequential, &kernel).unwrap_err();
    assert_eq!(
        err,
        LoopError::Access(AccessError::TileNotInScope {
            index: 1,
            in_scope: 1,
        })
    );

    let p = Policy::seq(0, [Policy::barrier(), Policy::body(0)]);
    let err = execute(&p, &space, &Sequential, &kernel).unwrap_err();
    assert_eq!(err, LoopError::Config(ConfigError::BarrierOutsideStaging));
}
