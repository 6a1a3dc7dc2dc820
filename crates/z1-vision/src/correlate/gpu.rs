use anyhow::{anyhow, Context, Result};
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use wgpu::util::DeviceExt;
use z1_data::{GroupKind, RoomMode, FLAT_VARIANCE};

use super::{
    floor_hit, CorrelationPlan, AGGREGATE_SAMPLES, AGG_BRIGHTNESS, AGG_GOLD, AGG_HEARTS, AGG_LEN,
    AGG_LIFE_RED, BRIGHTNESS_SAMPLES, FLOOR_SCORE_LEVELS, GOLD_SAMPLES, HEART_SAMPLES,
    LIFE_SAMPLES, ROOM_PIXELS,
};
use crate::calibration::CalibrationMapping;
use crate::layout::{
    BRIGHTNESS_COLS, BRIGHTNESS_STEP, FLOOR_COLS, FLOOR_ROWS, FLOOR_STRIDE, HEARTS_BOTTOM_Y,
    HEARTS_TOP_Y, HEARTS_X, HEART_SIZE, LIFE_W, LIFE_X, LIFE_Y, ROOM_CELL, ROOM_W, TRIFORCE_W,
    TRIFORCE_X, TRIFORCE_Y, VIEWPORT_Y,
};
use crate::scores::{Aggregates, RawFrameScores, ScoreMatrix, MAX_TEMPLATES};

const COMMON_WGSL: &str = include_str!("shaders/common.wgsl");
const TILES_WGSL: &str = include_str!("shaders/tiles.wgsl");
const ROOMS_WGSL: &str = include_str!("shaders/rooms.wgsl");
const FLOOR_WGSL: &str = include_str!("shaders/floor.wgsl");
const AGGREGATES_WGSL: &str = include_str!("shaders/aggregates.wgsl");

/// Storage bindings must not be empty.
const MIN_BUFFER_SIZE: u64 = 16;
const WORKGROUP: u32 = 64;
/// How often a pending readback checks the device.
const READBACK_POLL: Duration = Duration::from_millis(1);

/// Device and queue shared by every racer's correlator.
#[derive(Debug, Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
}

impl GpuContext {
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("No GPU adapter available")?;
        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("z1-vision"),
                ..Default::default()
            })
            .await
            .context("Failed to open GPU device")?;
        info!("GPU correlator on {} ({:?})", info.name, info.backend);
        Ok(Self {
            device,
            queue,
            adapter_name: info.name,
        })
    }
}

/// Uniform block shared by every pass; mirrors `Params` in common.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GpuParams {
    crop_x: f32,
    crop_y: f32,
    scale_x: f32,
    scale_y: f32,
    grid_dx: f32,
    grid_dy: f32,
    frame_w: u32,
    frame_h: u32,
    tile_count: u32,
    room_count: u32,
    drop_count: u32,
    _pad0: u32,
    life_x: f32,
    life_y: f32,
    triforce_x: f32,
    triforce_y: f32,
    hearts_x: f32,
    hearts_top_y: f32,
    hearts_bottom_y: f32,
    _pad1: f32,
}

impl GpuParams {
    fn new(
        mapping: &CalibrationMapping,
        frame_w: u32,
        frame_h: u32,
        tile_count: u32,
        room_count: u32,
        drop_count: u32,
    ) -> Self {
        Self {
            crop_x: mapping.crop_x,
            crop_y: mapping.crop_y,
            scale_x: mapping.scale_x,
            scale_y: mapping.scale_y,
            grid_dx: mapping.grid_dx,
            grid_dy: mapping.grid_dy,
            frame_w,
            frame_h,
            tile_count,
            room_count,
            drop_count,
            _pad0: 0,
            life_x: LIFE_X,
            life_y: LIFE_Y,
            triforce_x: TRIFORCE_X,
            triforce_y: TRIFORCE_Y,
            hearts_x: HEARTS_X,
            hearts_top_y: HEARTS_TOP_Y,
            hearts_bottom_y: HEARTS_BOTTOM_Y,
            _pad1: 0.0,
        }
    }
}

/// Mirrors `TileSlot` in tiles.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GpuTileSlot {
    x: f32,
    y: f32,
    height: u32,
    template_offset: u32,
    template_count: u32,
    _pad: [u32; 3],
}

/// Constants shared between Rust and every shader.
fn prelude() -> String {
    let u32s = [
        ("MAX_TEMPLATES", MAX_TEMPLATES as u32),
        ("ROOM_W", ROOM_W),
        ("ROOM_PIXELS", ROOM_PIXELS),
        ("FLOOR_COLS", FLOOR_COLS),
        ("FLOOR_ROWS", FLOOR_ROWS),
        ("FLOOR_STRIDE", FLOOR_STRIDE),
        ("DROP_PIXELS", {
            let (w, h) = GroupKind::Drops.size();
            w * h
        }),
        ("BRIGHTNESS_COLS", BRIGHTNESS_COLS),
        ("BRIGHTNESS_SAMPLES", BRIGHTNESS_SAMPLES),
        ("LIFE_W", LIFE_W),
        ("LIFE_SAMPLES", LIFE_SAMPLES),
        ("TRIFORCE_W", TRIFORCE_W),
        ("GOLD_SAMPLES", GOLD_SAMPLES),
        ("HEART_SIZE", HEART_SIZE),
        ("HEART_SAMPLES", HEART_SAMPLES),
        ("AGG_BRIGHTNESS", AGG_BRIGHTNESS as u32),
        ("AGG_LIFE_RED", AGG_LIFE_RED as u32),
        ("AGG_GOLD", AGG_GOLD as u32),
        ("AGG_HEARTS", AGG_HEARTS as u32),
    ];
    let f32s = [
        ("FLAT_VARIANCE", FLAT_VARIANCE),
        ("ROOM_CELL", ROOM_CELL),
        ("VIEWPORT_Y", VIEWPORT_Y),
        ("BRIGHTNESS_STEP", BRIGHTNESS_STEP),
        ("FLOOR_SCORE_LEVELS", FLOOR_SCORE_LEVELS),
    ];
    let mut out = String::new();
    for (name, value) in u32s {
        out.push_str(&format!("const {}: u32 = {}u;\n", name, value));
    }
    for (name, value) in f32s {
        out.push_str(&format!("const {}: f32 = {:?};\n", name, value));
    }
    out
}

fn shader_source(body: &str) -> String {
    format!("{}\n{}\n{}", prelude(), COMMON_WGSL, body)
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Bind group layout: params, frame, then the pass's own storage buffers.
fn pass_layout(device: &wgpu::Device, label: &str, storage: &[bool]) -> wgpu::BindGroupLayout {
    let mut entries = vec![uniform_entry(0), storage_entry(1, true)];
    entries.extend(
        storage
            .iter()
            .enumerate()
            .map(|(i, read_only)| storage_entry(i as u32 + 2, *read_only)),
    );
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}

fn pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn shader(device: &wgpu::Device, label: &str, body: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(shader_source(body).into()),
    })
}

fn storage_with(device: &wgpu::Device, label: &str, values: &[f32]) -> wgpu::Buffer {
    let mut bytes = bytemuck::cast_slice::<f32, u8>(values).to_vec();
    bytes.resize(bytes.len().max(MIN_BUFFER_SIZE as usize), 0);
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: &bytes,
        usage: wgpu::BufferUsages::STORAGE,
    })
}

fn output_buffer(device: &wgpu::Device, label: &str, words: usize) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (words as u64 * 4).max(MIN_BUFFER_SIZE),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn workgroups(items: u32) -> u32 {
    items.div_ceil(WORKGROUP)
}

type MapResult = std::result::Result<(), wgpu::BufferAsyncError>;

/// Drive the device without blocking until the map callback reports back.
async fn wait_for_map(device: &wgpu::Device, mut rx: oneshot::Receiver<MapResult>) -> Result<()> {
    let mut tick = tokio::time::interval(READBACK_POLL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        device
            .poll(wgpu::PollType::Poll)
            .context("GPU poll failed")?;
        match rx.try_recv() {
            Ok(result) => return result.context("GPU readback failed"),
            Err(TryRecvError::Closed) => return Err(anyhow!("GPU readback callback dropped")),
            Err(TryRecvError::Empty) => {
                tick.tick().await;
            }
        }
    }
}

/// Unmaps the staging buffer when readback ends, including on error or cancellation.
struct StagingGuard<'a>(&'a wgpu::Buffer);

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        self.0.unmap();
    }
}

struct Pipelines {
    tiles_layout: wgpu::BindGroupLayout,
    rooms_layout: wgpu::BindGroupLayout,
    floor_layout: wgpu::BindGroupLayout,
    aggregates_layout: wgpu::BindGroupLayout,
    tiles: wgpu::ComputePipeline,
    room_sample: wgpu::ComputePipeline,
    room_correlate: wgpu::ComputePipeline,
    floor: wgpu::ComputePipeline,
    aggregates: wgpu::ComputePipeline,
}

impl Pipelines {
    fn new(device: &wgpu::Device) -> Self {
        let tiles_layout = pass_layout(device, "z1-tiles", &[true, true, false]);
        let rooms_layout = pass_layout(device, "z1-rooms", &[true, false, false]);
        let floor_layout = pass_layout(device, "z1-floor", &[true, false]);
        let aggregates_layout = pass_layout(device, "z1-aggregates", &[false]);

        let tiles_module = shader(device, "z1-tiles", TILES_WGSL);
        let rooms_module = shader(device, "z1-rooms", ROOMS_WGSL);
        let floor_module = shader(device, "z1-floor", FLOOR_WGSL);
        let aggregates_module = shader(device, "z1-aggregates", AGGREGATES_WGSL);

        Self {
            tiles: pipeline(device, "z1-tiles", &tiles_layout, &tiles_module, "main"),
            room_sample: pipeline(device, "z1-room-sample", &rooms_layout, &rooms_module, "sample_main"),
            room_correlate: pipeline(
                device,
                "z1-room-correlate",
                &rooms_layout,
                &rooms_module,
                "correlate_main",
            ),
            floor: pipeline(device, "z1-floor", &floor_layout, &floor_module, "main"),
            aggregates: pipeline(
                device,
                "z1-aggregates",
                &aggregates_layout,
                &aggregates_module,
                "main",
            ),
            tiles_layout,
            rooms_layout,
            floor_layout,
            aggregates_layout,
        }
    }
}

/// Byte ranges of each output inside the staging buffer.
struct StagingLayout {
    tiles: Range<u64>,
    rooms: Range<u64>,
    floor: Range<u64>,
    aggregates: Range<u64>,
}

/// Per-racer GPU resources. Dropping this releases them.
pub struct GpuCorrelator {
    ctx: GpuContext,
    plan: CorrelationPlan,
    pipelines: Pipelines,
    params: wgpu::Buffer,
    frame: wgpu::Buffer,
    tile_slots: wgpu::Buffer,
    tile_templates: wgpu::Buffer,
    tile_scores: wgpu::Buffer,
    overworld_rooms: wgpu::Buffer,
    dungeon_rooms: wgpu::Buffer,
    room_patch: wgpu::Buffer,
    room_scores: wgpu::Buffer,
    drop_templates: wgpu::Buffer,
    floor_best: wgpu::Buffer,
    aggregates: wgpu::Buffer,
    staging: wgpu::Buffer,
    staging_layout: StagingLayout,
    tile_count: u32,
    drop_count: u32,
}

impl GpuCorrelator {
    /// Build pipelines and upload templates for one calibrated stream.
    pub async fn new(ctx: &GpuContext, plan: CorrelationPlan) -> Result<Self> {
        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let pipelines = Pipelines::new(device);

        // Tile templates are uploaded once per group and shared by its tiles
        let mut tile_values: Vec<f32> = Vec::new();
        let mut group_offsets: HashMap<GroupKind, u32> = HashMap::new();
        let mut slots = Vec::new();
        for tile in plan.layout.tiles() {
            let templates = plan.tile_templates(tile);
            let offset = *group_offsets.entry(tile.group).or_insert_with(|| {
                let offset = tile_values.len() as u32;
                for template in templates {
                    tile_values.extend_from_slice(&template.values);
                }
                offset
            });
            slots.push(GpuTileSlot {
                x: tile.nes_x,
                y: tile.nes_y,
                height: tile.size.height(),
                template_offset: offset,
                template_count: templates.len() as u32,
                _pad: [0; 3],
            });
        }
        let tile_count = if plan.passes.tiles { slots.len() as u32 } else { 0 };

        let room_values = |mode: RoomMode| -> Vec<f32> {
            plan.room_group(mode)
                .map(|g| g.templates.iter().flat_map(|t| t.values.iter().copied()).collect())
                .unwrap_or_default()
        };
        let drop_values: Vec<f32> = plan
            .drops()
            .map(|g| g.templates.iter().flat_map(|t| t.values.iter().copied()).collect())
            .unwrap_or_default();
        let drop_count = plan.drops().map_or(0, |g| g.len()) as u32;
        let max_rooms = RoomMode::Overworld
            .room_count()
            .max(RoomMode::Dungeon.room_count());

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("z1-params"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bytes = plan.mapping.video_width as u64 * plan.mapping.video_height as u64 * 4;
        let frame = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("z1-frame"),
            size: frame_bytes.max(MIN_BUFFER_SIZE),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut slot_bytes = bytemuck::cast_slice::<GpuTileSlot, u8>(&slots).to_vec();
        slot_bytes.resize(slot_bytes.len().max(MIN_BUFFER_SIZE as usize), 0);
        let tile_slots = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("z1-tile-slots"),
            contents: &slot_bytes,
            usage: wgpu::BufferUsages::STORAGE,
        });

        let tile_scores = output_buffer(device, "z1-tile-scores", slots.len() * MAX_TEMPLATES);
        let room_scores = output_buffer(device, "z1-room-scores", max_rooms);
        let floor_best = output_buffer(device, "z1-floor-best", drop_count as usize);
        let aggregates = output_buffer(device, "z1-aggregates", AGG_LEN);

        let mut offset = 0u64;
        let mut next = |buffer: &wgpu::Buffer| {
            let range = offset..offset + buffer.size();
            offset = range.end;
            range
        };
        let staging_layout = StagingLayout {
            tiles: next(&tile_scores),
            rooms: next(&room_scores),
            floor: next(&floor_best),
            aggregates: next(&aggregates),
        };
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("z1-staging"),
            size: staging_layout.aggregates.end,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let correlator = Self {
            pipelines,
            params,
            frame,
            tile_slots,
            tile_templates: storage_with(device, "z1-tile-templates", &tile_values),
            tile_scores,
            overworld_rooms: storage_with(device, "z1-overworld-rooms", &room_values(RoomMode::Overworld)),
            dungeon_rooms: storage_with(device, "z1-dungeon-rooms", &room_values(RoomMode::Dungeon)),
            room_patch: output_buffer(device, "z1-room-patch", ROOM_PIXELS as usize),
            room_scores,
            drop_templates: storage_with(device, "z1-drop-templates", &drop_values),
            floor_best,
            aggregates,
            staging,
            staging_layout,
            tile_count,
            drop_count,
            ctx: ctx.clone(),
            plan,
        };

        if let Some(err) = device.pop_error_scope().await {
            return Err(anyhow!("GPU pipeline setup failed: {}", err));
        }
        debug!(
            "GPU correlator ready: {} tiles, {} tile template values, {} drops",
            correlator.tile_count,
            tile_values.len(),
            correlator.drop_count
        );
        Ok(correlator)
    }

    pub fn plan(&self) -> &CorrelationPlan {
        &self.plan
    }

    fn room_count(&self, mode: RoomMode) -> u32 {
        self.plan.room_group(mode).map_or(0, |g| g.len()) as u32
    }

    fn bind_group(
        &self,
        label: &str,
        layout: &wgpu::BindGroupLayout,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: self.params.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: self.frame.as_entire_binding(),
            },
        ];
        entries.extend(buffers.iter().enumerate().map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32 + 2,
            resource: buffer.as_entire_binding(),
        }));
        self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &entries,
        })
    }

    /// Upload one frame, run every enabled pass and read all outputs back in one copy.
    pub async fn correlate(
        &mut self,
        frame: Arc<RgbaImage>,
        room_mode: RoomMode,
    ) -> Result<RawFrameScores> {
        let (w, h) = frame.dimensions();
        anyhow::ensure!(
            self.plan.mapping.matches(w, h),
            "frame {}x{} does not match calibration {}x{}",
            w,
            h,
            self.plan.mapping.video_width,
            self.plan.mapping.video_height
        );

        let room_count = self.room_count(room_mode);
        let params = GpuParams::new(
            &self.plan.mapping,
            w,
            h,
            self.tile_count,
            room_count,
            self.drop_count,
        );
        let queue = &self.ctx.queue;
        queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
        queue.write_buffer(&self.frame, 0, frame.as_raw());

        let room_templates = match room_mode {
            RoomMode::Overworld => &self.overworld_rooms,
            RoomMode::Dungeon => &self.dungeon_rooms,
        };
        let tiles_bg = self.bind_group(
            "z1-tiles",
            &self.pipelines.tiles_layout,
            &[&self.tile_slots, &self.tile_templates, &self.tile_scores],
        );
        let rooms_bg = self.bind_group(
            "z1-rooms",
            &self.pipelines.rooms_layout,
            &[room_templates, &self.room_patch, &self.room_scores],
        );
        let floor_bg = self.bind_group(
            "z1-floor",
            &self.pipelines.floor_layout,
            &[&self.drop_templates, &self.floor_best],
        );
        let aggregates_bg = self.bind_group(
            "z1-aggregates",
            &self.pipelines.aggregates_layout,
            &[&self.aggregates],
        );

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("z1-correlate"),
            });
        for buffer in [
            &self.tile_scores,
            &self.room_scores,
            &self.floor_best,
            &self.aggregates,
        ] {
            encoder.clear_buffer(buffer, 0, None);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("z1-correlate"),
                timestamp_writes: None,
            });
            if self.tile_count > 0 {
                pass.set_pipeline(&self.pipelines.tiles);
                pass.set_bind_group(0, &tiles_bg, &[]);
                pass.dispatch_workgroups(self.tile_count, 1, 1);
            }
            if room_count > 0 {
                pass.set_pipeline(&self.pipelines.room_sample);
                pass.set_bind_group(0, &rooms_bg, &[]);
                pass.dispatch_workgroups(workgroups(ROOM_PIXELS), 1, 1);
                pass.set_pipeline(&self.pipelines.room_correlate);
                pass.dispatch_workgroups(room_count, 1, 1);
            }
            if self.drop_count > 0 {
                pass.set_pipeline(&self.pipelines.floor);
                pass.set_bind_group(0, &floor_bg, &[]);
                pass.dispatch_workgroups(workgroups(FLOOR_COLS * FLOOR_ROWS), self.drop_count, 1);
            }
            pass.set_pipeline(&self.pipelines.aggregates);
            pass.set_bind_group(0, &aggregates_bg, &[]);
            pass.dispatch_workgroups(workgroups(AGGREGATE_SAMPLES), 1, 1);
        }
        let layout = &self.staging_layout;
        for (buffer, range) in [
            (&self.tile_scores, &layout.tiles),
            (&self.room_scores, &layout.rooms),
            (&self.floor_best, &layout.floor),
            (&self.aggregates, &layout.aggregates),
        ] {
            encoder.copy_buffer_to_buffer(buffer, 0, &self.staging, range.start, buffer.size());
        }
        queue.submit(Some(encoder.finish()));

        let (tx, rx) = oneshot::channel();
        self.staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        let _guard = StagingGuard(&self.staging);
        wait_for_map(&self.ctx.device, rx).await?;

        let scores = {
            let data = self.staging.slice(..).get_mapped_range();
            let words = |range: &Range<u64>| -> Vec<u32> {
                data[range.start as usize..range.end as usize]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            };
            let tile_scores: Vec<f32> = words(&layout.tiles).into_iter().map(f32::from_bits).collect();
            let rooms: Vec<f32> = words(&layout.rooms)
                .into_iter()
                .take(room_count as usize)
                .map(f32::from_bits)
                .collect();
            let floor = words(&layout.floor)
                .into_iter()
                .take(self.drop_count as usize)
                .enumerate()
                .map(|(t, key)| floor_hit(t, key))
                .collect();
            RawFrameScores {
                tiles: ScoreMatrix::from_flat(self.plan.score_shape(), &tile_scores),
                room_mode,
                rooms,
                floor,
                aggregates: Aggregates::from_counters(&words(&layout.aggregates)),
            }
        };
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::cpu::correlate_frame;
    use crate::layout::TileLayout;
    use crate::test_support::{gray, mapping, pattern, render};
    use crate::TileId;
    use z1_data::{TemplateAtlas, TemplateGroup};

    fn parity_plan() -> CorrelationPlan {
        let digits = (0..10).map(|d| (d.to_string(), pattern(d, 64))).collect();
        let drops = vec![
            ("heart".to_string(), pattern(20, 128)),
            ("bomb".to_string(), pattern(21, 128)),
        ];
        let rooms = (0..3)
            .map(|r| (format!("{}_0", r), pattern(40 + r, ROOM_PIXELS as usize)))
            .collect();
        let atlas = TemplateAtlas::from_groups([
            TemplateGroup::from_raw(GroupKind::Digits, digits).unwrap(),
            TemplateGroup::from_raw(GroupKind::Drops, drops).unwrap(),
            TemplateGroup::from_raw(GroupKind::DungeonRooms, rooms).unwrap(),
        ]);
        CorrelationPlan::new(Arc::new(atlas), mapping(), TileLayout::default())
    }

    /// Digit 7 in the first rupee tile, a bomb drop at (40, 100), LIFE in red.
    fn parity_frame() -> RgbaImage {
        let seven = pattern(7, 64);
        let bomb = pattern(21, 128);
        render(|x, y| {
            if (96..104).contains(&x) && (16..24).contains(&y) {
                gray(seven[((y - 16) * 8 + (x - 96)) as usize])
            } else if (184..232).contains(&x) && (16..24).contains(&y) {
                [220, 30, 30]
            } else if (40..48).contains(&x) && (100..116).contains(&y) {
                gray(bomb[((y - 100) * 8 + (x - 40)) as usize])
            } else if y >= 64 {
                [120, 120, 120]
            } else {
                [0, 0, 0]
            }
        })
    }

    fn assert_close(a: &[f32], b: &[f32], what: &str) {
        assert_eq!(a.len(), b.len(), "{} length", what);
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < 1e-3, "{}[{}]: gpu {} cpu {}", what, i, x, y);
        }
    }

    #[test]
    fn test_shaders_validate() {
        for (name, body) in [
            ("tiles", TILES_WGSL),
            ("rooms", ROOMS_WGSL),
            ("floor", FLOOR_WGSL),
            ("aggregates", AGGREGATES_WGSL),
        ] {
            let source = shader_source(body);
            let module = naga::front::wgsl::parse_str(&source)
                .unwrap_or_else(|e| panic!("{}: {}", name, e.emit_to_string(&source)));
            naga::valid::Validator::new(
                naga::valid::ValidationFlags::all(),
                naga::valid::Capabilities::default(),
            )
            .validate(&module)
            .unwrap_or_else(|e| panic!("{}: {:?}", name, e));
        }
    }

    #[tokio::test]
    async fn test_gpu_matches_cpu() {
        let Ok(ctx) = GpuContext::new().await else {
            eprintln!("no GPU adapter, skipping");
            return;
        };
        let plan = parity_plan();
        let frame = Arc::new(parity_frame());
        let expected = correlate_frame(&plan, &frame, RoomMode::Dungeon).unwrap();
        let mut gpu = GpuCorrelator::new(&ctx, plan).await.unwrap();

        // Twice, so the second frame reuses the staging buffer
        for _ in 0..2 {
            let actual = gpu.correlate(frame.clone(), RoomMode::Dungeon).await.unwrap();
            for (id, _) in gpu.plan().score_shape() {
                assert_close(actual.tiles.tile(id), expected.tiles.tile(id), id.as_str());
            }
            assert_close(&actual.rooms, &expected.rooms, "rooms");
            assert_eq!(actual.floor.len(), expected.floor.len());
            for (a, b) in actual.floor.iter().zip(&expected.floor) {
                assert_eq!((a.template, a.x, a.y), (b.template, b.x, b.y));
                assert!((a.score - b.score).abs() < 1e-3);
            }
            let (a, b) = (actual.aggregates, expected.aggregates);
            assert!((a.brightness - b.brightness).abs() < 1e-2);
            assert_eq!(a.red_ratio, b.red_ratio);
            assert_eq!(a.gold_pixels, b.gold_pixels);
        }
        let row = expected.tiles.tile(TileId::Rupee0);
        assert!(row[7] > 0.99);
    }

    #[tokio::test]
    async fn test_cancelled_readback_leaves_correlator_usable() {
        let Ok(ctx) = GpuContext::new().await else {
            eprintln!("no GPU adapter, skipping");
            return;
        };
        let mut gpu = GpuCorrelator::new(&ctx, parity_plan()).await.unwrap();
        let frame = Arc::new(parity_frame());
        let _ = tokio::time::timeout(
            Duration::ZERO,
            gpu.correlate(frame.clone(), RoomMode::Overworld),
        )
        .await;
        let scores = gpu.correlate(frame, RoomMode::Overworld).await.unwrap();
        assert!(scores.aggregates.red_ratio > 90.0);
    }

    #[test]
    fn test_params_layout_matches_shader() {
        assert_eq!(std::mem::size_of::<GpuParams>(), 80);
        assert_eq!(std::mem::size_of::<GpuTileSlot>(), 32);
    }

    #[test]
    fn test_prelude_defines_shader_constants() {
        let source = prelude();
        for name in [
            "MAX_TEMPLATES",
            "ROOM_PIXELS",
            "DROP_PIXELS",
            "FLAT_VARIANCE",
            "FLOOR_SCORE_LEVELS",
            "AGG_HEARTS",
        ] {
            assert!(source.contains(&format!("const {}:", name)), "{} missing", name);
        }
        assert!(source.contains("const MAX_TEMPLATES: u32 = 32u;"));
        assert!(source.contains("const DROP_PIXELS: u32 = 128u;"));
    }

    #[test]
    fn test_params_copy_mapping() {
        let mapping = CalibrationMapping {
            crop_x: 10.0,
            crop_y: 4.0,
            scale_x: 2.5,
            scale_y: 2.0,
            grid_dx: 0.25,
            grid_dy: 0.0,
            video_width: 800,
            video_height: 600,
            confidence: 0.9,
        };
        let params = GpuParams::new(&mapping, 800, 600, 10, 128, 7);
        assert_eq!(params.scale_x, 2.5);
        assert_eq!(params.grid_dx, 0.25);
        assert_eq!((params.frame_w, params.frame_h), (800, 600));
        assert_eq!(params.room_count, 128);
        assert_eq!(params.life_x, LIFE_X);
    }
}
