// zasm-demo - assembles a small self-checking story file.
//
// The produced story prints "pass", calls a two-parameter routine that
// prints both arguments, queries an object's sibling, and quits. Run it
// under any conformant Z-machine interpreter to black-box-check the
// backend's output:
//
//   expected output:  pass
//                     12
//                     2

use std::env;
use std::fs;
use std::process;

use zasm::{CodeGenError, Operand, Program, StoreTarget, ZObject};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut output = String::from("demo.z3");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-o" | "--output" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: -o requires a filename");
                    process::exit(1);
                }
                output = args[i + 1].clone();
                i += 2;
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            arg => {
                eprintln!("Error: unknown option '{}'", arg);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let story = match build() {
        Ok(story) => story,
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = fs::write(&output, &story) {
        eprintln!("Error: cannot write '{}': {}", output, err);
        process::exit(1);
    }
    println!("Wrote {} ({} bytes)", output, story.len());
}

fn print_usage(name: &str) {
    eprintln!("Usage: {} [-o <file>]", name);
    eprintln!();
    eprintln!("Assembles a self-checking version-3 story file (default: demo.z3).");
}

fn build() -> Result<Vec<u8>, CodeGenError> {
    let mut program = Program::new();

    program.objects(
        &[
            ZObject {
                name: "alpha".into(),
                ..Default::default()
            },
            ZObject {
                name: "beta".into(),
                ..Default::default()
            },
        ],
        &[],
        &[],
    )?;

    let show_pair = program.routine("show-pair");
    {
        let routine = program.routine_mut(show_pair);
        let first = routine.alloc_var(None)?;
        let second = routine.alloc_var(None)?;
        routine.print_num(first)?;
        routine.print_num(second)?;
        routine.rtrue()?;
    }

    let one = Operand::constant(1)?;
    let two = Operand::constant(2)?;

    let main = program.main_routine();
    main.print("pass")?;
    main.new_line()?;
    main.call(show_pair, &[one.into(), two.into()], StoreTarget::stack())?;
    main.new_line()?;
    // "alpha" is object 1; its sibling is "beta", object 2.
    main.get_sibling(Operand::byte(1), StoreTarget::stack(), None)?;
    main.print_num(Operand::stack())?;
    main.new_line()?;
    main.quit()?;

    program.finalize()
}
