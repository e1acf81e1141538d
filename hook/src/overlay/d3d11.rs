//! Direct3D 11 renderer: textured quads over the bitmap font, drawn with the
//! host's own device and immediate context.

use std::mem::size_of;

use shared::config::DisplaySettings;
use shared::frame::FrameReadout;
use tracing::debug;
use windows::core::{s, PCSTR};
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::{build_vertices, font, Layout, OverlayText, Vertex, MAX_VERTICES};
use crate::handler::OverlayError;

const SHADER_SOURCE: &str = r#"
struct VsInput {
    float2 pos : POSITION;
    float2 uv : TEXCOORD0;
    float4 color : COLOR0;
};

struct PsInput {
    float4 pos : SV_POSITION;
    float2 uv : TEXCOORD0;
    float4 color : COLOR0;
};

Texture2D font_atlas : register(t0);
SamplerState font_sampler : register(s0);

PsInput vs_main(VsInput input) {
    PsInput output;
    output.pos = float4(input.pos, 0.0, 1.0);
    output.uv = input.uv;
    output.color = input.color;
    return output;
}

float4 ps_main(PsInput input) : SV_TARGET {
    float coverage = input.uv.x < 0.0 ? 1.0 : font_atlas.Sample(font_sampler, input.uv).r;
    return float4(input.color.rgb, input.color.a * coverage);
}
"#;

fn created<T>(what: &'static str, slot: Option<T>) -> Result<T, OverlayError> {
    slot.ok_or_else(|| OverlayError::resource(what, "no object returned"))
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}

unsafe fn compile_shader(entry_point: PCSTR, target: PCSTR) -> Result<ID3DBlob, OverlayError> {
    let mut blob: Option<ID3DBlob> = None;
    let mut error_blob: Option<ID3DBlob> = None;

    let result = D3DCompile(
        SHADER_SOURCE.as_ptr() as *const _,
        SHADER_SOURCE.len(),
        None,
        None,
        None,
        entry_point,
        target,
        D3DCOMPILE_OPTIMIZATION_LEVEL3,
        0,
        &mut blob,
        Some(&mut error_blob),
    );

    if let Err(e) = result {
        let message = match error_blob {
            Some(errors) => String::from_utf8_lossy(blob_bytes(&errors)).into_owned(),
            None => e.to_string(),
        };
        return Err(OverlayError::Resource("shader", message));
    }
    created("shader", blob)
}

/// Device objects that live as long as the overlay.
struct Pipeline {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    input_layout: ID3D11InputLayout,
    vertex_buffer: ID3D11Buffer,
    font_view: ID3D11ShaderResourceView,
    sampler: ID3D11SamplerState,
    blend: ID3D11BlendState,
    rasterizer: ID3D11RasterizerState,
    depth_stencil: ID3D11DepthStencilState,
}

impl Pipeline {
    unsafe fn create(device: &ID3D11Device) -> Result<Self, OverlayError> {
        let vs_blob = compile_shader(s!("vs_main"), s!("vs_4_0"))?;
        let ps_blob = compile_shader(s!("ps_main"), s!("ps_4_0"))?;

        let mut vertex_shader = None;
        device
            .CreateVertexShader(blob_bytes(&vs_blob), None, Some(&mut vertex_shader))
            .map_err(|e| OverlayError::resource("vertex shader", e))?;

        let mut pixel_shader = None;
        device
            .CreatePixelShader(blob_bytes(&ps_blob), None, Some(&mut pixel_shader))
            .map_err(|e| OverlayError::resource("pixel shader", e))?;

        let input_elements = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 8,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("COLOR"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 16,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];
        let mut input_layout = None;
        device
            .CreateInputLayout(&input_elements, blob_bytes(&vs_blob), Some(&mut input_layout))
            .map_err(|e| OverlayError::resource("input layout", e))?;

        let buffer_desc = D3D11_BUFFER_DESC {
            ByteWidth: (size_of::<Vertex>() * MAX_VERTICES) as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let mut vertex_buffer = None;
        device
            .CreateBuffer(&buffer_desc, None, Some(&mut vertex_buffer))
            .map_err(|e| OverlayError::resource("vertex buffer", e))?;

        let pixels = font::atlas_pixels();
        let texture_desc = D3D11_TEXTURE2D_DESC {
            Width: font::ATLAS_WIDTH as u32,
            Height: font::ATLAS_HEIGHT as u32,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_R8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let texture_data = D3D11_SUBRESOURCE_DATA {
            pSysMem: pixels.as_ptr() as *const _,
            SysMemPitch: font::ATLAS_WIDTH as u32,
            SysMemSlicePitch: 0,
        };
        let mut texture: Option<ID3D11Texture2D> = None;
        device
            .CreateTexture2D(&texture_desc, Some(&texture_data), Some(&mut texture))
            .map_err(|e| OverlayError::resource("font texture", e))?;
        let texture = created("font texture", texture)?;

        let mut font_view = None;
        device
            .CreateShaderResourceView(&texture, None, Some(&mut font_view))
            .map_err(|e| OverlayError::resource("font view", e))?;

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_POINT,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        let mut sampler = None;
        device
            .CreateSamplerState(&sampler_desc, Some(&mut sampler))
            .map_err(|e| OverlayError::resource("sampler", e))?;

        let mut blend_desc = D3D11_BLEND_DESC::default();
        blend_desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            SrcBlend: D3D11_BLEND_SRC_ALPHA,
            DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D11_BLEND_OP_ADD,
            SrcBlendAlpha: D3D11_BLEND_ONE,
            DestBlendAlpha: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOpAlpha: D3D11_BLEND_OP_ADD,
            RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
        };
        let mut blend = None;
        device
            .CreateBlendState(&blend_desc, Some(&mut blend))
            .map_err(|e| OverlayError::resource("blend state", e))?;

        let rasterizer_desc = D3D11_RASTERIZER_DESC {
            FillMode: D3D11_FILL_SOLID,
            CullMode: D3D11_CULL_NONE,
            DepthClipEnable: true.into(),
            ..Default::default()
        };
        let mut rasterizer = None;
        device
            .CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer))
            .map_err(|e| OverlayError::resource("rasterizer state", e))?;

        let depth_desc = D3D11_DEPTH_STENCIL_DESC {
            DepthEnable: false.into(),
            DepthWriteMask: D3D11_DEPTH_WRITE_MASK_ZERO,
            DepthFunc: D3D11_COMPARISON_ALWAYS,
            StencilEnable: false.into(),
            ..Default::default()
        };
        let mut depth_stencil = None;
        device
            .CreateDepthStencilState(&depth_desc, Some(&mut depth_stencil))
            .map_err(|e| OverlayError::resource("depth-stencil state", e))?;

        Ok(Self {
            vertex_shader: created("vertex shader", vertex_shader)?,
            pixel_shader: created("pixel shader", pixel_shader)?,
            input_layout: created("input layout", input_layout)?,
            vertex_buffer: created("vertex buffer", vertex_buffer)?,
            font_view: created("font view", font_view)?,
            sampler: created("sampler", sampler)?,
            blend: created("blend state", blend)?,
            rasterizer: created("rasterizer state", rasterizer)?,
            depth_stencil: created("depth-stencil state", depth_stencil)?,
        })
    }
}

/// Render-target view of back buffer 0 and its size.
struct BackBuffer {
    view: ID3D11RenderTargetView,
    size: (f32, f32),
}

/// Pipeline state the overlay touches, captured before drawing and put back
/// afterwards so the host never sees our bindings.
struct SavedState {
    render_targets: [Option<ID3D11RenderTargetView>; 1],
    depth_view: Option<ID3D11DepthStencilView>,
    viewports: [D3D11_VIEWPORT; 1],
    viewport_count: u32,
    rasterizer: Option<ID3D11RasterizerState>,
    blend: Option<ID3D11BlendState>,
    blend_factor: [f32; 4],
    sample_mask: u32,
    depth_stencil: Option<ID3D11DepthStencilState>,
    stencil_ref: u32,
    input_layout: Option<ID3D11InputLayout>,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    vertex_buffer: Option<ID3D11Buffer>,
    stride: u32,
    offset: u32,
    vertex_shader: Option<ID3D11VertexShader>,
    pixel_shader: Option<ID3D11PixelShader>,
    shader_resources: [Option<ID3D11ShaderResourceView>; 1],
    samplers: [Option<ID3D11SamplerState>; 1],
}

impl SavedState {
    unsafe fn capture(context: &ID3D11DeviceContext) -> Self {
        let mut state = SavedState {
            render_targets: [None],
            depth_view: None,
            viewports: [D3D11_VIEWPORT::default()],
            viewport_count: 1,
            rasterizer: context.RSGetState().ok(),
            blend: None,
            blend_factor: [0.0; 4],
            sample_mask: 0,
            depth_stencil: None,
            stencil_ref: 0,
            input_layout: context.IAGetInputLayout().ok(),
            topology: context.IAGetPrimitiveTopology(),
            vertex_buffer: None,
            stride: 0,
            offset: 0,
            vertex_shader: None,
            pixel_shader: None,
            shader_resources: [None],
            samplers: [None],
        };

        context.OMGetRenderTargets(Some(&mut state.render_targets), Some(&mut state.depth_view));
        context.RSGetViewports(&mut state.viewport_count, Some(state.viewports.as_mut_ptr()));
        context.OMGetBlendState(
            Some(&mut state.blend),
            Some(state.blend_factor.as_mut_ptr()),
            Some(&mut state.sample_mask),
        );
        context.OMGetDepthStencilState(Some(&mut state.depth_stencil), Some(&mut state.stencil_ref));
        context.IAGetVertexBuffers(
            0,
            1,
            Some(&mut state.vertex_buffer),
            Some(&mut state.stride),
            Some(&mut state.offset),
        );
        context.VSGetShader(&mut state.vertex_shader, None, None);
        context.PSGetShader(&mut state.pixel_shader, None, None);
        context.PSGetShaderResources(0, Some(&mut state.shader_resources));
        context.PSGetSamplers(0, Some(&mut state.samplers));
        state
    }

    unsafe fn restore(self, context: &ID3D11DeviceContext) {
        context.OMSetRenderTargets(Some(&self.render_targets), self.depth_view.as_ref());
        let count = (self.viewport_count as usize).min(self.viewports.len());
        context.RSSetViewports(Some(&self.viewports[..count]));
        context.RSSetState(self.rasterizer.as_ref());
        context.OMSetBlendState(self.blend.as_ref(), Some(&self.blend_factor), self.sample_mask);
        context.OMSetDepthStencilState(self.depth_stencil.as_ref(), self.stencil_ref);
        context.IASetInputLayout(self.input_layout.as_ref());
        context.IASetPrimitiveTopology(self.topology);
        context.IASetVertexBuffers(
            0,
            1,
            Some(&self.vertex_buffer),
            Some(&self.stride),
            Some(&self.offset),
        );
        context.VSSetShader(self.vertex_shader.as_ref(), None);
        context.PSSetShader(self.pixel_shader.as_ref(), None);
        context.PSSetShaderResources(0, Some(&self.shader_resources));
        context.PSSetSamplers(0, Some(&self.samplers));
    }
}

pub struct D3d11Overlay {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    pipeline: Pipeline,
    back_buffer: Option<BackBuffer>,
}

impl D3d11Overlay {
    /// # Safety
    /// `device` must be the device that owns `swap_chain`.
    pub unsafe fn new(device: ID3D11Device, swap_chain: &IDXGISwapChain) -> Result<Self, OverlayError> {
        let context = device
            .GetImmediateContext()
            .map_err(|e| OverlayError::resource("immediate context", e))?;
        let pipeline = Pipeline::create(&device)?;

        let mut overlay = Self {
            device,
            context,
            pipeline,
            back_buffer: None,
        };
        overlay.create_back_buffer(swap_chain)?;
        Ok(overlay)
    }

    pub fn release_back_buffer(&mut self) {
        self.back_buffer = None;
    }

    /// # Safety
    /// `swap_chain` must belong to this overlay's device.
    pub unsafe fn create_back_buffer(&mut self, swap_chain: &IDXGISwapChain) -> Result<(), OverlayError> {
        self.back_buffer = None;

        let texture: ID3D11Texture2D = swap_chain
            .GetBuffer(0)
            .map_err(|e| OverlayError::resource("back buffer", e))?;
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        texture.GetDesc(&mut desc);

        let mut view = None;
        self.device
            .CreateRenderTargetView(&texture, None, Some(&mut view))
            .map_err(|e| OverlayError::resource("render-target view", e))?;

        debug!(width = desc.Width, height = desc.Height, "Back buffer view created");
        self.back_buffer = Some(BackBuffer {
            view: created("render-target view", view)?,
            size: (desc.Width as f32, desc.Height as f32),
        });
        Ok(())
    }

    /// # Safety
    /// Must run on the host's render thread, inside its presentation call.
    pub unsafe fn draw(&mut self, readout: &FrameReadout, settings: &DisplaySettings) -> Result<(), OverlayError> {
        let Some(back_buffer) = &self.back_buffer else {
            return Ok(());
        };
        if back_buffer.size.0 < 1.0 || back_buffer.size.1 < 1.0 {
            return Ok(());
        }

        let text = OverlayText::compose(readout, settings.show_frame_time);
        let layout = Layout::compute(settings, &text, back_buffer.size);
        let vertices = build_vertices(&layout, &text, settings);
        if vertices.is_empty() {
            return Ok(());
        }

        let pipeline = &self.pipeline;
        let context = &self.context;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        context
            .Map(&pipeline.vertex_buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
            .map_err(|e| OverlayError::Draw(format!("vertex buffer map: {e}")))?;
        std::ptr::copy_nonoverlapping(vertices.as_ptr(), mapped.pData as *mut Vertex, vertices.len());
        context.Unmap(&pipeline.vertex_buffer, 0);

        let saved = SavedState::capture(context);

        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: back_buffer.size.0,
            Height: back_buffer.size.1,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        context.OMSetRenderTargets(Some(&[Some(back_buffer.view.clone())]), None);
        context.RSSetViewports(Some(&[viewport]));
        context.RSSetState(&pipeline.rasterizer);
        context.OMSetBlendState(&pipeline.blend, Some(&[0.0; 4]), u32::MAX);
        context.OMSetDepthStencilState(&pipeline.depth_stencil, 0);
        context.IASetInputLayout(&pipeline.input_layout);
        context.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
        let stride = size_of::<Vertex>() as u32;
        let offset = 0u32;
        context.IASetVertexBuffers(
            0,
            1,
            Some(&Some(pipeline.vertex_buffer.clone())),
            Some(&stride),
            Some(&offset),
        );
        context.VSSetShader(&pipeline.vertex_shader, None);
        context.PSSetShader(&pipeline.pixel_shader, None);
        context.PSSetShaderResources(0, Some(&[Some(pipeline.font_view.clone())]));
        context.PSSetSamplers(0, Some(&[Some(pipeline.sampler.clone())]));

        context.Draw(vertices.len() as u32, 0);

        saved.restore(context);
        Ok(())
    }
}
