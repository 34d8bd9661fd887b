//! End-to-end pipeline scenarios driven through the library API with a
//! scripted host, checking observed standard output.

use qbc_drv::run_scripted;

#[test]
fn s1_hello_world() {
    let out = run_scripted("PRINT \"Hello, World!\"\nEND", &[]).unwrap();
    assert_eq!(out.trim_end(), "Hello, World!");
}

#[test]
fn s2_primes_up_to_ten() {
    let src = r#"
INPUT "Limit"; limit
PRINT "Prime numbers up to"; limit; ":"
FOR candidate = 2 TO limit
  divisors = 0
  FOR d = 2 TO candidate - 1
    IF candidate MOD d = 0 THEN divisors = divisors + 1
  NEXT d
  IF divisors = 0 THEN PRINT candidate;
NEXT candidate
PRINT
PRINT "Done!"
"#;
    let out = run_scripted(src, &["10"]).unwrap();
    assert!(out.contains("Prime numbers up to 10 :"));
    assert!(out.contains(" 2  3  5  7 "));
    assert!(out.trim_end().ends_with("Done!"));
}

#[test]
fn s3_for_loop_with_step() {
    let out = run_scripted("FOR i = 10 TO 0 STEP -2\n  PRINT i;\nNEXT i", &[]).unwrap();
    assert_eq!(out, " 10  8  6  4  2  0 ");
}

#[test]
fn s4_select_case() {
    let src = r#"DIM s AS INTEGER : s = 85
SELECT CASE s
  CASE IS >= 90: PRINT "A"
  CASE 80 TO 89: PRINT "B"
  CASE ELSE:     PRINT "?"
END SELECT"#;
    assert_eq!(run_scripted(src, &[]).unwrap().trim_end(), "B");
}

#[test]
fn s5_data_read_restore() {
    let src = r#"READ a,b : PRINT a;b
RESTORE L2
READ a,b : PRINT a;b
DATA 10,20
L2: DATA 100,200"#;
    assert_eq!(run_scripted(src, &[]).unwrap(), " 10  20 \n 100  200 \n");
}

#[test]
fn s6_gosub_ordering() {
    let src = "PRINT \"A\" : GOSUB S : PRINT \"C\" : END\nS: PRINT \"B\" : RETURN";
    assert_eq!(run_scripted(src, &[]).unwrap(), "A\nB\nC\n");
}

#[test]
fn boundary_failures() {
    assert_eq!(run_scripted("x = 1 / 0", &[]).unwrap_err(), "DivideByZero");
    assert_eq!(
        run_scripted("DIM a(10)\na(11) = 1", &[]).unwrap_err(),
        "BoundsViolation"
    );
    assert_eq!(run_scripted("RETURN", &[]).unwrap_err(), "ReturnWithoutGosub");
    assert_eq!(
        run_scripted("READ x\nREAD y\nDATA 1", &[]).unwrap_err(),
        "OutOfData"
    );
}

#[test]
fn unbounded_recursion_overflows() {
    let src = "FUNCTION F% (n%)\nF% = F%(n%)\nEND FUNCTION\nPRINT F%(1)";
    assert_eq!(run_scripted(src, &[]).unwrap_err(), "StackOverflow");
}

#[test]
fn boundary_zero_iteration_loops() {
    assert_eq!(
        run_scripted("FOR i = 1 TO 0\nPRINT \"x\"\nNEXT\nPRINT \"done\"", &[]).unwrap(),
        "done\n"
    );
    assert_eq!(
        run_scripted("FOR i = 1 TO 10 STEP 0\nPRINT \"x\"\nNEXT\nPRINT \"done\"", &[]).unwrap(),
        "done\n"
    );
}

#[test]
fn determinism_with_fixed_seed_and_input() {
    let src = "RANDOMIZE 5\nINPUT n\nFOR i = 1 TO n\nPRINT RND;\nNEXT\nPRINT";
    let a = run_scripted(src, &["4"]).unwrap();
    let b = run_scripted(src, &["4"]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn nested_types_and_procedures() {
    let src = r#"
TYPE Vec2
  x AS SINGLE
  y AS SINGLE
END TYPE

DIM SHARED origin AS Vec2

SUB Move (v AS Vec2, BYVAL dx, BYVAL dy)
  v.x = v.x + dx
  v.y = v.y + dy
END SUB

origin.x = 1
origin.y = 2
Move origin, 10, 20
PRINT origin.x; origin.y
"#;
    // Whole records pass by reference, so Move updates the original.
    let out = run_scripted(src, &[]).unwrap();
    assert_eq!(out, " 11  22 \n");
}

#[test]
fn while_wend_and_string_building() {
    let src = r#"
s$ = ""
n = 0
WHILE n < 5
  s$ = s$ + CHR$(65 + n)
  n = n + 1
WEND
PRINT s$
"#;
    assert_eq!(run_scripted(src, &[]).unwrap().trim_end(), "ABCDE");
}
