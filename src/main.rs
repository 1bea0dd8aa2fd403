use clap::Parser;
use color_eyre::eyre;
use oclgrind::script::{Action, Op, ScriptKernel, ScriptProgram};
use oclgrind::{AddrSpace, Config, Device, Dim, NDRange, Pointer, Type, Variable};

#[derive(Debug, Parser)]
#[command(author, version, about = "Data-parallel kernel simulator and debugger")]
struct Options {
    /// Global work size, e.g. 16,1,1
    #[arg(long, default_value = "16,1,1")]
    global_size: Dim,

    /// Global work offset
    #[arg(long)]
    global_offset: Option<Dim>,

    /// Local work size, e.g. 4,1,1
    #[arg(long, default_value = "4,1,1")]
    local_size: Dim,

    /// Enter the interactive debugger
    #[arg(long)]
    interactive: bool,

    /// Report executed instruction counts after the run
    #[arg(long)]
    inst_counts: bool,

    /// Run only the first and last work-groups
    #[arg(long)]
    quick: bool,
}

const DEMO_SOURCE: &str = "\
__kernel void write_ids(__global uint *out) {
  uint gid = get_global_id(0);
  out[gid] = gid;
  barrier(CLK_GLOBAL_MEM_FENCE);
  uint check = out[gid];
}";

fn demo_kernel(out_base: u64) -> ScriptKernel {
    let ops = vec![
        Op::compute("call llvm.dbg.value", 2),
        Op::compute("mul", 2),
        Op {
            opcode: "store".to_string(),
            line: 3,
            action: Action::Store {
                space: AddrSpace::Global,
                base: out_base,
                stride: 4,
            },
        },
        Op {
            opcode: "bar".to_string(),
            line: 4,
            action: Action::Barrier,
        },
        Op {
            opcode: "load".to_string(),
            line: 5,
            action: Action::Load {
                space: AddrSpace::Global,
                base: out_base,
                stride: 4,
                size: 4,
            },
        },
        Op::compute("ret", 6),
    ];
    ScriptKernel::new(
        "write_ids",
        ScriptProgram::new(1, "write_ids.cl", Some(DEMO_SOURCE.to_string()), ops),
    )
    .with_arg(
        "out",
        Variable::Pointer(Pointer {
            space: AddrSpace::Global,
            address: out_base,
            elem: Type::U32,
            indirect: false,
        }),
    )
    .with_arg(
        "gid",
        Variable::Scalar {
            ty: Type::U32,
            data: 0u32.to_le_bytes().to_vec(),
        },
    )
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    let mut config = Config::from_env();
    config.interactive |= options.interactive;
    config.show_inst_counts |= options.inst_counts;
    config.quick_mode |= options.quick;

    let ndrange = NDRange::new(
        3,
        options.global_size,
        options.global_offset.unwrap_or(Dim::ZERO),
        options.local_size,
    );

    let mut device = Device::new(config);
    let out_base = device
        .global_memory_mut()
        .alloc(options.global_size.size() * 4)?;
    let mut kernel = demo_kernel(out_base);

    log::info!(
        "running '{}' over global {} local {}",
        "write_ids",
        options.global_size,
        options.local_size
    );
    device.run(&mut kernel, ndrange);
    Ok(())
}
