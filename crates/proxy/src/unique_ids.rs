//! Deduplication of per-pixel ids through a bucketed hash table.
//!
//! The result is approximate: ids hashing into a full bucket are dropped,
//! as are ids beyond the output capacity.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use mev::{Argument, Invocation, KernelContext, PipelineStages};

use crate::{
    config::IdTableConfig,
    graph::{FrameGraph, Resource, Usage},
    readback::{Readback, ReadbackId},
    volume::work_groups,
    ProxyError,
};

/// Marks texels without an id and free table slots.
pub const NO_ID: u32 = u32::MAX;

const TILE: [u32; 3] = [8, 8, 1];

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Constants {
    extent: [u32; 2],
    num_buckets: u32,
    bucket_capacity: u32,
    output_capacity: u32,
    _pad: [u32; 3],
}

/// Inserts the id of every texel into its bucket.
struct Reduce;

impl mev::Kernel for Reduce {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let c: Constants = cx.constants();
        let [x, y, _] = inv.global;
        if x >= c.extent[0] || y >= c.extent[1] {
            return;
        }

        let id = cx.image(0).load_u32(x, y);
        if id == NO_ID {
            return;
        }

        let slots = cx.buffer(1);
        let counts = cx.buffer(2);
        let bucket = id % c.num_buckets;
        let first = bucket * c.bucket_capacity;

        for slot in first..first + c.bucket_capacity {
            match slots.atomic_compare_exchange(slot, NO_ID, id) {
                Ok(_) => {
                    counts.atomic_add(bucket * 2, 1);
                    return;
                }
                Err(found) if found == id => return,
                Err(_) => {}
            }
        }

        counts.atomic_add(bucket * 2 + 1, 1);
    }
}

/// Flattens buckets into the result list. One work group per bucket.
struct BucketReduce;

impl mev::Kernel for BucketReduce {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let c: Constants = cx.constants();
        let bucket = inv.group[0];
        let slot = inv.local[0];
        if bucket >= c.num_buckets || slot >= c.bucket_capacity {
            return;
        }

        let id = cx.buffer(0).load(bucket * c.bucket_capacity + slot);
        if id == NO_ID {
            return;
        }

        // Count never exceeds the output capacity.
        let result = cx.buffer(1);
        let mut count = result.load(0);
        while count < c.output_capacity {
            match result.atomic_compare_exchange(0, count, count + 1) {
                Ok(_) => {
                    result.store(1 + count, id);
                    return;
                }
                Err(actual) => count = actual,
            }
        }
    }
}

fn first_word(bytes: &[u8]) -> Option<u32> {
    let word = bytes.get(..4)?;
    Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

enum ReadbackState {
    Waiting { frames: u32 },
    Pending(ReadbackId),
}

/// Reduces a per-pixel id image to a list of distinct ids.
pub struct UniqueIdExtractor {
    config: IdTableConfig,
    reduce: mev::ComputePipeline,
    bucket_reduce: mev::ComputePipeline,
    slots: mev::Buffer,

    /// Occupancy and overflow count per bucket.
    counts: mev::Buffer,

    /// Id count followed by ids.
    result: mev::Buffer,

    readback: ReadbackState,
    last_readback: Option<u32>,
}

impl UniqueIdExtractor {
    pub fn new(device: &mev::Device, config: &IdTableConfig) -> Result<Self, ProxyError> {
        config.validate()?;

        let reduce = device.new_compute_pipeline(mev::ComputePipelineDesc {
            name: "unique_ids_reduce",
            kernel: Arc::new(Reduce),
            work_group_size: TILE,
        })?;
        let bucket_reduce = device.new_compute_pipeline(mev::ComputePipelineDesc {
            name: "unique_ids_bucket_reduce",
            kernel: Arc::new(BucketReduce),
            work_group_size: [config.bucket_capacity, 1, 1],
        })?;

        let table_size = config.num_buckets as usize * config.bucket_capacity as usize;
        tracing::debug!(
            "Id table of {} buckets by {} slots, output capacity {}",
            config.num_buckets,
            config.bucket_capacity,
            config.output_capacity,
        );

        let slots = device.new_buffer(mev::BufferDesc {
            size: table_size * 4,
            usage: mev::BufferUsage::STORAGE | mev::BufferUsage::TRANSFER_DST,
            memory: mev::Memory::Device,
            name: "id-bucket-slots",
        })?;
        let counts = device.new_buffer(mev::BufferDesc {
            size: config.num_buckets as usize * 8,
            usage: mev::BufferUsage::STORAGE | mev::BufferUsage::TRANSFER_DST,
            memory: mev::Memory::Device,
            name: "id-bucket-counts",
        })?;
        let result = device.new_buffer(mev::BufferDesc {
            size: (1 + config.output_capacity as usize) * 4,
            usage: mev::BufferUsage::STORAGE
                | mev::BufferUsage::TRANSFER_SRC
                | mev::BufferUsage::TRANSFER_DST,
            memory: mev::Memory::Device,
            name: "unique-ids",
        })?;

        Ok(UniqueIdExtractor {
            config: *config,
            reduce,
            bucket_reduce,
            slots,
            counts,
            result,
            readback: ReadbackState::Waiting { frames: 0 },
            last_readback: None,
        })
    }

    pub fn config(&self) -> &IdTableConfig {
        &self.config
    }

    /// Count at word 0, ids from word 1.
    pub fn result(&self) -> &mev::Buffer {
        &self.result
    }

    /// Expected number of ids lost when the image holds `distinct_ids` distinct ids.
    pub fn expected_loss(&self, distinct_ids: u32) -> f64 {
        self.config.expected_loss(distinct_ids)
    }

    /// Records the extraction over level 0 of `ids`, an `R32Uint` image.
    pub fn run(&mut self, graph: &mut impl FrameGraph, ids: &mev::Image) -> Result<(), ProxyError> {
        let extent = ids.level_extent(0);
        let c = Constants {
            extent: extent.0,
            num_buckets: self.config.num_buckets,
            bucket_capacity: self.config.bucket_capacity,
            output_capacity: self.config.output_capacity,
            _pad: [0; 3],
        };

        let mut pass = graph.pass(
            "extract_unique_ids",
            &[
                (Resource::Image(ids), Usage::Sample { level: 0 }),
                (Resource::Buffer(&self.slots), Usage::ReadWrite),
                (Resource::Buffer(&self.counts), Usage::ReadWrite),
                (Resource::Buffer(&self.result), Usage::ReadWrite),
            ],
        );

        // FILL
        pass.barrier(PipelineStages::ALL_COMMANDS, PipelineStages::TRANSFER);
        let mut copy = pass.copy();
        copy.fill_buffer(&self.slots, NO_ID);
        copy.fill_buffer(&self.counts, 0);
        copy.fill_buffer(self.result.slice(..4), 0);
        pass.barrier(PipelineStages::TRANSFER, PipelineStages::COMPUTE_SHADER);

        // REDUCE
        let mut compute = pass.compute();
        compute.with_pipeline(&self.reduce);
        compute.with_arguments(&[
            Argument::sampled(ids, 0),
            Argument::read_write(&self.slots),
            Argument::read_write(&self.counts),
        ]);
        compute.with_constants(&c);
        compute.dispatch([
            work_groups(extent.width(), TILE[0]),
            work_groups(extent.height(), TILE[1]),
            1,
        ]);

        pass.barrier(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER);

        // BUCKET_REDUCE
        let mut compute = pass.compute();
        compute.with_pipeline(&self.bucket_reduce);
        compute.with_arguments(&[
            Argument::read(&self.slots),
            Argument::read_write(&self.result),
        ]);
        compute.with_constants(&c);
        compute.dispatch([self.config.num_buckets, 1, 1]);

        Ok(())
    }

    /// Occupancy of every bucket as of the last completed run.
    pub fn bucket_occupancy(&self) -> Vec<u32> {
        self.counts
            .read_pod::<[u32; 2]>(0, self.config.num_buckets as usize)
            .into_iter()
            .map(|[occupancy, _]| occupancy)
            .collect()
    }

    /// Number of insertions dropped on full buckets in the last completed run.
    pub fn overflowed(&self) -> u32 {
        self.counts
            .read_pod::<[u32; 2]>(0, self.config.num_buckets as usize)
            .into_iter()
            .map(|[_, overflow]| overflow)
            .sum()
    }

    /// Advances the diagnostic readback of the id count. Call once per frame.
    ///
    /// A read is scheduled every `readback_delay_frames` frames and polled until fetched.
    pub fn process_readback(
        &mut self,
        readback: &mut impl Readback,
        encoder: &mut mev::CommandEncoder,
    ) {
        match &mut self.readback {
            ReadbackState::Waiting { frames } if *frames < self.config.readback_delay_frames => {
                *frames += 1;
            }
            ReadbackState::Waiting { .. } => {
                let id = readback.submit_read(encoder, self.result.slice(..4));
                self.readback = if id.is_valid() {
                    ReadbackState::Pending(id)
                } else {
                    ReadbackState::Waiting { frames: 0 }
                };
            }
            ReadbackState::Pending(id) => {
                let id = *id;
                if !readback.is_ready(id) {
                    return;
                }
                if let Some(count) = readback.fetch(id).as_deref().and_then(first_word) {
                    tracing::info!(unique_ids = count, "Unique id count");
                    if count >= self.config.output_capacity {
                        tracing::warn!(
                            "Unique id output is full at {count} ids, further ids are dropped"
                        );
                    }
                    self.last_readback = Some(count);
                }
                self.readback = ReadbackState::Waiting { frames: 0 };
            }
        }
    }

    /// Id count fetched by the last completed diagnostic readback.
    pub fn last_readback(&self) -> Option<u32> {
        self.last_readback
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;
    use rand::{seq::SliceRandom, Rng, SeedableRng};

    use crate::{graph::SequentialGraph, readback::BufferReadback};

    use super::*;

    fn setup() -> (mev::Device, mev::Queue) {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        (device, queues.remove(0))
    }

    fn id_image(device: &mev::Device, extent: mev::Extent2, ids: &[u32]) -> mev::Image {
        let image = device
            .new_image(mev::ImageDesc::new_2d(
                extent,
                mev::PixelFormat::R32Uint,
                mev::ImageUsage::SAMPLED,
                "ids",
            ))
            .unwrap();
        image.write_level(0, ids);
        image
    }

    fn extract(
        queue: &mut mev::Queue,
        extractor: &mut UniqueIdExtractor,
        image: &mev::Image,
    ) -> Vec<u32> {
        let mut graph = SequentialGraph::begin(queue).unwrap();
        extractor.run(&mut graph, image).unwrap();
        graph.submit(queue).unwrap();
        queue.wait_idle().unwrap();
        assert!(queue.hazards().is_empty());

        let count = extractor.result().read_pod::<u32>(0, 1)[0];
        extractor.result().read_pod(4, count as usize)
    }

    #[test]
    fn distinct_ids_of_tiles() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(128, 128);

        // 50 ids in vertical strips, background elsewhere.
        let ids: Vec<u32> = (0..128u32)
            .flat_map(|_| (0..128u32).map(|x| if x < 100 { 7 + x / 2 * 13 } else { NO_ID }))
            .collect();
        let image = id_image(&device, extent, &ids);

        let mut extractor = UniqueIdExtractor::new(&device, &IdTableConfig::default()).unwrap();
        let mut found = extract(&mut queue, &mut extractor, &image);
        found.sort_unstable();

        let expected: Vec<u32> = (0..50).map(|i| 7 + i * 13).collect();
        assert_eq!(found, expected);
        assert_eq!(extractor.overflowed(), 0);
    }

    #[test]
    fn extraction_is_idempotent() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(64, 64);
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);

        let pool: Vec<u32> = (0..600).map(|_| rng.gen_range(0..1 << 28)).collect();
        let ids: Vec<u32> = (0..extent.area())
            .map(|_| *pool.choose(&mut rng).unwrap())
            .collect();
        let image = id_image(&device, extent, &ids);

        let mut extractor = UniqueIdExtractor::new(&device, &IdTableConfig::default()).unwrap();
        let first: HashSet<u32> = extract(&mut queue, &mut extractor, &image)
            .into_iter()
            .collect();
        let second: Vec<u32> = extract(&mut queue, &mut extractor, &image);

        assert_eq!(second.len(), first.len());
        assert_eq!(second.into_iter().collect::<HashSet<_>>(), first);
        assert_eq!(first, ids.iter().copied().collect::<HashSet<_>>());
    }

    #[test]
    fn full_buckets_drop_ids() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(32, 32);
        let config = IdTableConfig {
            num_buckets: 4,
            bucket_capacity: 8,
            ..IdTableConfig::default()
        };

        let ids: Vec<u32> = (0..extent.area()).collect();
        let image = id_image(&device, extent, &ids);

        let mut extractor = UniqueIdExtractor::new(&device, &config).unwrap();
        let found = extract(&mut queue, &mut extractor, &image);

        assert_eq!(found.len(), 32);
        assert_eq!(found.iter().copied().collect::<HashSet<_>>().len(), 32);
        assert!(extractor.bucket_occupancy().iter().all(|&n| n <= 8));
        assert_eq!(extractor.overflowed(), 1024 - 32);
        assert!(extractor.expected_loss(1024) > 900.0);
    }

    #[test]
    fn rejects_unaddressable_table() {
        let (device, _queue) = setup();
        let config = IdTableConfig {
            num_buckets: 1 << 20,
            bucket_capacity: 1 << 12,
            ..IdTableConfig::default()
        };
        assert!(matches!(
            UniqueIdExtractor::new(&device, &config),
            Err(ProxyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn output_capacity_bounds_count() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(16, 16);
        let config = IdTableConfig {
            output_capacity: 100,
            ..IdTableConfig::default()
        };

        let ids: Vec<u32> = (0..extent.area()).collect();
        let image = id_image(&device, extent, &ids);

        let mut extractor = UniqueIdExtractor::new(&device, &config).unwrap();
        let found = extract(&mut queue, &mut extractor, &image);
        assert_eq!(found.len(), 100);
    }

    #[test]
    fn delayed_count_readback() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(8, 8);
        let config = IdTableConfig {
            readback_delay_frames: 2,
            ..IdTableConfig::default()
        };
        let ids: Vec<u32> = (0..extent.area()).map(|i| i % 5).collect();
        let image = id_image(&device, extent, &ids);

        let mut extractor = UniqueIdExtractor::new(&device, &config).unwrap();
        let mut readback = BufferReadback::new(&device);

        for _ in 0..8 {
            let mut graph = SequentialGraph::begin(&mut queue).unwrap();
            extractor.run(&mut graph, &image).unwrap();
            extractor.process_readback(&mut readback, graph.encoder());
            graph.submit(&mut queue).unwrap();
            queue.wait_idle().unwrap();
            readback.after_submit(&queue);

            if extractor.last_readback().is_some() {
                break;
            }
        }

        assert_eq!(extractor.last_readback(), Some(5));
        assert_eq!(readback.pending(), 0);
        assert!(queue.hazards().is_empty());
    }
}
