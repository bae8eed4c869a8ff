//! Integration tests for cache buffers, allocation and the layer set.

use half::f16;

use kv_sink_cache::cache::{
    BlockAllocator, CacheError, CacheLayerSet, KvShape, LayerCache, TensorBuffer,
};

/// `[batch, heads, n, head_dim]` rows with a distinct value per element.
fn pattern(shape: KvShape, start: usize, n: usize) -> Vec<f32> {
    let mut out = Vec::new();
    for plane in 0..shape.planes() {
        for t in start..start + n {
            for d in 0..shape.head_dim() {
                out.push((plane * 100_000 + t * 10 + d) as f32 + 0.25);
            }
        }
    }
    out
}

#[test]
fn test_growth_preserves_data_bit_for_bit() {
    let shape = KvShape::new(2, 3, 4).unwrap();
    let mut buf =
        TensorBuffer::create(shape, &pattern(shape, 0, 37), 40, BlockAllocator::default())
            .unwrap();
    let before = buf.view().to_bytes();

    for new_capacity in [41, 100, 1000] {
        buf.grow(new_capacity).unwrap();
        assert_eq!(buf.capacity(), new_capacity);
        assert_eq!(buf.len(), 37);
        assert_eq!(buf.view().to_bytes(), before);
    }
}

#[test]
fn test_append_precondition_never_overwrites() {
    let shape = KvShape::new(1, 2, 2).unwrap();
    let mut buf =
        TensorBuffer::create(shape, &pattern(shape, 0, 6), 8, BlockAllocator::default()).unwrap();
    let before = buf.view().to_contiguous();

    for extra in [3, 4, 100] {
        let err = buf.append(&pattern(shape, 6, extra)).unwrap_err();
        assert_eq!(
            err,
            CacheError::CapacityExceeded {
                required: 6 + extra,
                capacity: 8
            }
        );
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.view().to_contiguous(), before);
    }

    buf.append(&pattern(shape, 6, 2)).unwrap();
    assert_eq!(buf.view().to_contiguous(), pattern(shape, 0, 8));
}

#[test]
fn test_half_precision_storage() {
    let shape = KvShape::new(1, 1, 4).unwrap();
    let rows: Vec<f16> = (0..8).map(|i| f16::from_f32(i as f32)).collect();
    let mut layer = LayerCache::new(shape, BlockAllocator::new(2).unwrap());
    layer.reserve_and_append(&rows, &rows).unwrap();

    assert_eq!(layer.len(), 2);
    assert_eq!(layer.capacity(), 4);
    // 2 tensors * 4 slots * 4 elements * 2 bytes
    assert_eq!(layer.bytes_allocated(), 64);
    assert_eq!(layer.valid_slice().0.row(0, 0, 1)[3], f16::from_f32(7.0));
}

#[test]
fn test_synchronized_length_across_layers() {
    let shape = KvShape::new(1, 2, 2).unwrap();
    let mut cache: CacheLayerSet<f32> =
        CacheLayerSet::new(4, shape, BlockAllocator::new(16).unwrap()).unwrap();

    let mut position = 0;
    for n in [7, 1, 1, 30, 1, 5] {
        let rows: Vec<Vec<f32>> = (0..4).map(|_| pattern(shape, position, n)).collect();
        cache.append_step(&rows, &rows).unwrap();
        position += n;

        assert!(cache.is_synchronized());
        let lengths: Vec<usize> = cache.layers().iter().map(|l| l.len()).collect();
        assert_eq!(lengths, vec![position; 4]);
        assert!(cache.layers().iter().all(|l| l.capacity() >= l.len()));
    }

    cache.truncate_front_and_back(4, 10).unwrap();
    assert!(cache.is_synchronized());
    assert_eq!(cache.current_length(), 14);
}

#[test]
fn test_per_layer_appends_resynchronize_after_step() {
    let shape = KvShape::new(1, 1, 1).unwrap();
    let mut cache: CacheLayerSet<f32> =
        CacheLayerSet::new(3, shape, BlockAllocator::default()).unwrap();

    // A forward pass appends layer by layer; the set is consistent once every
    // layer has been written.
    for i in 0..3 {
        cache
            .layer_mut(i)
            .unwrap()
            .reserve_and_append(&[1.0, 2.0], &[3.0, 4.0])
            .unwrap();
    }
    assert!(cache.is_synchronized());
    assert_eq!(cache.current_length(), 2);
    assert!(cache.layer(3).is_none());
}

#[test]
fn test_stats_track_growth_and_bytes() {
    let shape = KvShape::new(1, 1, 8).unwrap();
    let mut cache: CacheLayerSet<f32> =
        CacheLayerSet::new(2, shape, BlockAllocator::new(4).unwrap()).unwrap();

    let rows: Vec<Vec<f32>> = (0..2).map(|_| vec![0.5; 8 * 3]).collect();
    cache.append_step(&rows, &rows).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.layers, 2);
    assert_eq!(stats.length, 3);
    assert_eq!(stats.capacity, 7);
    assert_eq!(stats.grow_count, 2);
    // 2 layers * 2 tensors * 7 slots * 8 elements * 4 bytes
    assert_eq!(stats.bytes_allocated, 2 * 2 * 7 * 8 * 4);
}

fn is_allocation_failure(err: &CacheError) -> bool {
    matches!(err, CacheError::AllocationFailure { .. })
}

#[test]
fn test_failed_grow_leaves_buffer_untouched() {
    let shape = KvShape::new(1, 2, 3).unwrap();
    let mut buf =
        TensorBuffer::create(shape, &pattern(shape, 0, 5), 8, BlockAllocator::default()).unwrap();
    let before = buf.view().to_bytes();

    let err = buf.grow(usize::MAX / 2).unwrap_err();
    assert!(is_allocation_failure(&err));
    assert_eq!(buf.len(), 5);
    assert_eq!(buf.capacity(), 8);
    assert_eq!(buf.view().to_bytes(), before);

    // Still usable afterwards.
    buf.append(&pattern(shape, 5, 3)).unwrap();
    assert_eq!(buf.view().to_contiguous(), pattern(shape, 0, 8));
}

#[test]
fn test_create_with_unallocatable_capacity_fails() {
    let shape = KvShape::new(1, 1, 4).unwrap();
    let err = TensorBuffer::<f32>::create(
        shape,
        &pattern(shape, 0, 2),
        usize::MAX / 2,
        BlockAllocator::default(),
    )
    .unwrap_err();
    assert!(is_allocation_failure(&err));
}

#[test]
fn test_failed_set_reserve_leaves_every_layer_untouched() {
    let shape = KvShape::new(1, 2, 2).unwrap();
    let mut cache: CacheLayerSet<f32> =
        CacheLayerSet::new(3, shape, BlockAllocator::new(4).unwrap()).unwrap();
    let rows: Vec<Vec<f32>> = (0..3).map(|_| pattern(shape, 0, 6)).collect();
    cache.append_step(&rows, &rows).unwrap();

    let snapshot = |cache: &CacheLayerSet<f32>| -> Vec<(usize, usize, Vec<u8>, Vec<u8>)> {
        cache
            .layers()
            .iter()
            .map(|l| {
                let (k, v) = l.valid_slice();
                (l.len(), l.capacity(), k.to_bytes(), v.to_bytes())
            })
            .collect()
    };
    let before = snapshot(&cache);
    let stats_before = cache.stats();

    let err = cache.reserve(usize::MAX / 2).unwrap_err();
    assert!(is_allocation_failure(&err));
    assert_eq!(snapshot(&cache), before);
    assert!(cache.is_synchronized());
    assert_eq!(cache.stats().grow_count, stats_before.grow_count);
    assert_eq!(cache.stats().bytes_allocated, stats_before.bytes_allocated);

    let step: Vec<Vec<f32>> = (0..3).map(|_| pattern(shape, 6, 1)).collect();
    cache.append_step(&step, &step).unwrap();
    assert_eq!(cache.current_length(), 7);
}

#[test]
fn test_failed_layer_growth_leaves_layer_untouched() {
    let shape = KvShape::new(1, 1, 2).unwrap();
    let mut layer: LayerCache<f32> = LayerCache::new(shape, BlockAllocator::new(4).unwrap());
    layer
        .reserve_and_append(&pattern(shape, 0, 3), &pattern(shape, 0, 3))
        .unwrap();
    let (k, v) = layer.valid_slice();
    let (key_before, value_before) = (k.to_bytes(), v.to_bytes());

    let err = layer.reserve(usize::MAX / 2).unwrap_err();
    assert!(is_allocation_failure(&err));
    assert_eq!(layer.len(), 3);
    assert_eq!(layer.capacity(), 7);
    assert_eq!(layer.grow_count(), 1);
    let (k, v) = layer.valid_slice();
    assert_eq!(k.to_bytes(), key_before);
    assert_eq!(v.to_bytes(), value_before);
}

#[test]
fn test_failed_append_growth_leaves_layers_empty() {
    // A block this large can never be allocated, so the first append's
    // growth fails.
    let shape = KvShape::new(1, 1, 2).unwrap();
    let allocator = BlockAllocator::new(usize::MAX / 4).unwrap();

    let mut layer: LayerCache<f32> = LayerCache::new(shape, allocator);
    let rows = pattern(shape, 0, 2);
    let err = layer.reserve_and_append(&rows, &rows).unwrap_err();
    assert!(is_allocation_failure(&err));
    assert_eq!(layer.len(), 0);
    assert_eq!(layer.capacity(), 0);
    assert_eq!(layer.grow_count(), 0);

    let mut cache: CacheLayerSet<f32> = CacheLayerSet::new(2, shape, allocator).unwrap();
    let step = vec![rows.clone(), rows];
    assert!(is_allocation_failure(&cache.append_step(&step, &step).unwrap_err()));
    assert!(cache.layers().iter().all(|l| l.is_empty() && l.capacity() == 0));
    assert_eq!(cache.stats().grow_count, 0);
}
